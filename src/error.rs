//! Typed failures callers may want to match on.
//!
//! These travel inside `anyhow::Error` like every other failure in the crate;
//! use `err.downcast_ref::<LiveOsError>()` to inspect them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LiveOsError {
    #[error("failed to find the {file} file:\nthis file is provided by the {packages} package")]
    MissingBootloader { file: String, packages: String },

    #[error("did not find any kernels installed under ({0})")]
    MissingKernel(String),

    #[error("unsupported scenario: found more than one kernel under ({0})")]
    MultipleKernels(String),

    #[error("package ({package}) is not installed:\nthe following packages must be installed to generate an iso: {}", required.join(", "))]
    MissingPackage {
        package: String,
        required: Vec<String>,
    },

    #[error("cannot set both iso image base url and full image url at the same time")]
    PxeUrlConflict,

    #[error("dracut package ({found}) does not support PXE booting (minimum required: {minimum})")]
    PxeUnsupported { found: String, minimum: String },

    #[error("did not find a '{command}' command in grub configuration")]
    GrubCommandNotFound { command: String },

    #[error("did not find a '{arg}=' kernel argument in grub configuration")]
    KernelArgNotFound { arg: String },

    #[error("{0}")]
    CleanupFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_bootloader_names_the_package() {
        let err = LiveOsError::MissingBootloader {
            file: "bootx64.efi".into(),
            packages: "(shim)".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("bootx64.efi"));
        assert!(msg.contains("(shim)"));
    }

    #[test]
    fn missing_package_lists_requirements() {
        let err = LiveOsError::MissingPackage {
            package: "curl".into(),
            required: vec!["tar".into(), "curl".into()],
        };
        assert!(err.to_string().contains("tar, curl"));
    }

    #[test]
    fn downcast_through_anyhow() {
        let err: anyhow::Error = LiveOsError::PxeUrlConflict.into();
        let err = err.context("validating options");
        assert!(matches!(
            err.downcast_ref::<LiveOsError>(),
            Some(LiveOsError::PxeUrlConflict)
        ));
    }
}
