use thiserror::Error;

/// Callback supplied by the mount manager to detach every host mount of an
/// instance. It is consumed by the shutdown sequence, so it runs at most once.
pub type StopMounts = Box<dyn FnOnce(&str) -> Result<(), MountError>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MountError {
    #[error("failed to unmount `{target}`: {message}")]
    Unmount { target: String, message: String },
    #[error("{0}")]
    Other(String),
}

/// Mount-stop callback for instances without host mounts.
pub fn no_mounts() -> StopMounts {
    Box::new(|_instance: &str| -> Result<(), MountError> { Ok(()) })
}
