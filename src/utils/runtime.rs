use anyhow::Result;

/// The core is cooperative and event driven, a single-threaded runtime is all it needs.
pub fn single_thread_runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}
