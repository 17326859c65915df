//! Compilation targets
//!
//! A [`TargetDescriptor`] names the device an artifact is built for, the
//! codegen attributes it was built with, and the host it is paired with for
//! reference runs. Its textual form is
//!
//! ```text
//! accel -arch=v68 -link-params=1 -host=cpu
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rexec_device::DeviceKind;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const ARCH_ATTR: &str = "arch";
const HOST_ATTR: &str = "host";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetDescriptor {
    device_kind: DeviceKind,
    codegen_attributes: BTreeMap<String, String>,
    host_pairing: Option<Box<TargetDescriptor>>,
}

impl TargetDescriptor {
    pub fn accelerator(arch: impl Into<String>) -> Self {
        Self {
            device_kind: DeviceKind::accelerator(arch),
            codegen_attributes: BTreeMap::new(),
            host_pairing: None,
        }
    }

    pub fn host_cpu() -> Self {
        Self {
            device_kind: DeviceKind::HostCpu,
            codegen_attributes: BTreeMap::new(),
            host_pairing: None,
        }
    }

    pub fn with_host(mut self, host: TargetDescriptor) -> Self {
        self.host_pairing = Some(Box::new(host));
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.codegen_attributes.insert(key.into(), value.into());
        self
    }

    pub fn device_kind(&self) -> &DeviceKind {
        &self.device_kind
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.codegen_attributes.get(key).map(String::as_str)
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.codegen_attributes
    }

    /// The paired host target, or `self` when there is none.
    pub fn host(&self) -> &TargetDescriptor {
        self.host_pairing.as_deref().unwrap_or(self)
    }

    pub fn is_host(&self) -> bool {
        self.device_kind == DeviceKind::HostCpu
    }
}

impl fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.device_kind {
            DeviceKind::Accelerator { arch } => write!(f, "accel -{ARCH_ATTR}={arch}")?,
            DeviceKind::HostCpu => f.write_str("cpu")?,
        }
        for (key, value) in &self.codegen_attributes {
            write!(f, " -{key}={value}")?;
        }
        if let Some(host) = &self.host_pairing {
            // Only the host's kind survives; attributes on the host are not
            // part of the textual form.
            match &host.device_kind {
                DeviceKind::HostCpu => write!(f, " -{HOST_ATTR}=cpu")?,
                DeviceKind::Accelerator { arch } => write!(f, " -{HOST_ATTR}=accel:{arch}")?,
            }
        }
        Ok(())
    }
}

impl FromStr for TargetDescriptor {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        let mut words = text.split_whitespace();
        let kind = words.next().ok_or_else(|| Error::Config("empty target string".into()))?;

        let mut arch = None;
        let mut host = None;
        let mut attributes = BTreeMap::new();
        for word in words {
            let (key, value) = word
                .strip_prefix('-')
                .and_then(|flag| flag.split_once('='))
                .ok_or_else(|| Error::Config(format!("malformed target attribute `{word}`, expected -key=value")))?;
            match key {
                ARCH_ATTR => arch = Some(value.to_string()),
                HOST_ATTR => host = Some(parse_host(value)?),
                _ => {
                    attributes.insert(key.to_string(), value.to_string());
                }
            }
        }

        let device_kind = match kind {
            "accel" => DeviceKind::accelerator(
                arch.ok_or_else(|| Error::Config(format!("target `{text}` needs -{ARCH_ATTR}=<arch>")))?,
            ),
            "cpu" if arch.is_none() => DeviceKind::HostCpu,
            "cpu" => return Err(Error::Config("the cpu target takes no -arch".into())),
            other => return Err(Error::Config(format!("unknown target kind `{other}`"))),
        };
        Ok(Self {
            device_kind,
            codegen_attributes: attributes,
            host_pairing: host.map(Box::new),
        })
    }
}

fn parse_host(value: &str) -> Result<TargetDescriptor> {
    match value.split_once(':') {
        None if value == "cpu" => Ok(TargetDescriptor::host_cpu()),
        Some(("accel", arch)) if !arch.is_empty() => Ok(TargetDescriptor::accelerator(arch)),
        _ => Err(Error::Config(format!("unknown host target `{value}`"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_textual_form_round_trips() {
        let target = TargetDescriptor::accelerator("v68")
            .with_attr("link-params", "1")
            .with_host(TargetDescriptor::host_cpu());
        let text = target.to_string();
        assert_eq!(text, "accel -arch=v68 -link-params=1 -host=cpu");
        assert_eq!(text.parse::<TargetDescriptor>().unwrap(), target);
        assert_eq!("cpu".parse::<TargetDescriptor>().unwrap(), TargetDescriptor::host_cpu());
    }

    #[test]
    fn test_host_falls_back_to_self() {
        let host = TargetDescriptor::host_cpu();
        assert_eq!(host.host(), &host);
        let paired = TargetDescriptor::accelerator("v73").with_host(host.clone());
        assert_eq!(paired.host(), &host);
        assert!(paired.host().is_host());
        assert!(!paired.is_host());
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["", "accel", "gpu -arch=x", "accel -arch", "cpu -arch=v68", "accel -arch=v68 -host=tpu"] {
            assert!(bad.parse::<TargetDescriptor>().is_err(), "`{bad}` should not parse");
        }
    }
}
