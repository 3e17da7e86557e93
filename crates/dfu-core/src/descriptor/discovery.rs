//! DFU interface discovery across configurations.

use std::fmt;

use super::{ConfigurationDescriptor, InterfaceDescriptor};
use crate::protocol::constants::*;

/// Mode advertised by a DFU interface's protocol field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuMode {
    Runtime,
    Dfu,
}

impl fmt::Display for DfuMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuMode::Runtime => write!(f, "Runtime"),
            DfuMode::Dfu => write!(f, "DFU"),
        }
    }
}

/// One DFU-capable interface/alternate setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSettings {
    pub configuration_value: u8,
    pub interface: InterfaceDescriptor,
    /// Resolved from `iInterface` once the device is open.
    pub name: Option<String>,
}

impl InterfaceSettings {
    pub fn interface_number(&self) -> u8 {
        self.interface.interface_number
    }

    pub fn alternate_setting(&self) -> u8 {
        self.interface.alternate_setting
    }

    pub fn mode(&self) -> DfuMode {
        if self.interface.interface_protocol == DFU_PROTOCOL_RUNTIME {
            DfuMode::Runtime
        } else {
            DfuMode::Dfu
        }
    }
}

impl fmt::Display for InterfaceSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: [cfg={}, intf={}, alt={}, name=\"{}\"]",
            self.mode(),
            self.configuration_value,
            self.interface_number(),
            self.alternate_setting(),
            self.name.as_deref().unwrap_or("UNKNOWN")
        )
    }
}

/// Every configuration × interface × alternate setting that speaks DFU.
pub fn find_dfu_interfaces(configurations: &[ConfigurationDescriptor]) -> Vec<InterfaceSettings> {
    configurations
        .iter()
        .flat_map(|config| {
            config
                .interfaces()
                .filter(|intf| {
                    intf.is_dfu()
                        && matches!(
                            intf.interface_protocol,
                            DFU_PROTOCOL_RUNTIME | DFU_PROTOCOL_DFU_MODE
                        )
                })
                .map(move |intf| InterfaceSettings {
                    configuration_value: config.configuration_value,
                    interface: intf.clone(),
                    name: None,
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{Descriptor, DfuFunctionalDescriptor};

    #[test]
    fn test_discovery_filters_class_and_protocol() {
        let func = DfuFunctionalDescriptor::new(0x0D, 0, 1024, 0x0110);
        let mut hid = InterfaceDescriptor::dfu(1, 0, DFU_PROTOCOL_RUNTIME, 0, None);
        hid.interface_class = 0x03;
        let odd = InterfaceDescriptor::dfu(2, 0, 0x05, 0, None);

        let configs = vec![
            ConfigurationDescriptor::new(
                1,
                vec![
                    Descriptor::Interface(InterfaceDescriptor::dfu(
                        0,
                        0,
                        DFU_PROTOCOL_DFU_MODE,
                        0,
                        Some(func),
                    )),
                    Descriptor::Interface(InterfaceDescriptor::dfu(
                        0,
                        1,
                        DFU_PROTOCOL_DFU_MODE,
                        0,
                        None,
                    )),
                    Descriptor::Interface(hid),
                    Descriptor::Interface(odd),
                ],
            ),
            ConfigurationDescriptor::new(
                2,
                vec![Descriptor::Interface(InterfaceDescriptor::dfu(
                    0,
                    0,
                    DFU_PROTOCOL_RUNTIME,
                    0,
                    None,
                ))],
            ),
        ];

        let found = find_dfu_interfaces(&configs);
        assert_eq!(found.len(), 3);
        assert_eq!(found[1].alternate_setting(), 1);
        assert_eq!(found[2].configuration_value, 2);
        assert_eq!(found[2].mode(), DfuMode::Runtime);
        assert_eq!(
            found[0].to_string(),
            "DFU: [cfg=1, intf=0, alt=0, name=\"UNKNOWN\"]"
        );
    }
}
