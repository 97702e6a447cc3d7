//! Processor wrapper.
//!
//! A processor binds one kernel to a slot in an audio unit and forwards
//! string-keyed parameter updates to it. The kernel is chosen by the
//! `p_proc_type.json` key and may be replaced by uploading a new type.

use crate::device::{DeviceId, ParamValue, ProcImpl};
use crate::error::EngineError;
use crate::procs::new_proc_impl;

#[derive(Debug)]
pub struct Processor {
    pub existent: bool,
    pub kernel: Option<Box<dyn ProcImpl>>,
    pub device_id: DeviceId,
}

impl Processor {
    pub fn new() -> Self {
        Self {
            existent: false,
            kernel: None,
            device_id: 0,
        }
    }

    pub fn proc_type(&self) -> Option<&'static str> {
        self.kernel.as_ref().map(|k| k.proc_type())
    }

    /// Replace the kernel. An unknown type name is a format error.
    pub fn set_proc_type(&mut self, name: &str) -> Result<(), EngineError> {
        self.kernel = Some(new_proc_impl(name).ok_or_else(|| {
            EngineError::format(format!("Unsupported processor type: {}", name))
        })?);
        Ok(())
    }

    /// Forward a parameter key to the kernel, if one is installed.
    pub fn set_param(&mut self, key: &str, value: &ParamValue) -> Result<(), EngineError> {
        if let Some(kernel) = &mut self.kernel {
            kernel.set_param(key, value)?;
        }
        Ok(())
    }

    pub fn supports_voices(&self) -> bool {
        self.kernel.as_ref().map(|k| k.supports_voices()).unwrap_or(false)
    }

    pub fn has_mixed_output(&self) -> bool {
        self.kernel
            .as_ref()
            .map(|k| k.has_mixed_output())
            .unwrap_or(false)
    }
}

impl Default for Processor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_is_selected_by_type_name() {
        let mut proc_ = Processor::new();
        proc_.set_proc_type("add").unwrap();
        assert_eq!(proc_.proc_type(), Some("add"));
        assert!(proc_.supports_voices());
        assert!(proc_.set_proc_type("warbler").is_err());
    }

    #[test]
    fn params_without_a_kernel_are_ignored() {
        let mut proc_ = Processor::new();
        proc_
            .set_param("p_f_volume.json", &ParamValue::Float(1.0))
            .unwrap();
    }
}
