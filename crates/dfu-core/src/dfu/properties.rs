//! Capabilities derived from the DFU functional descriptor.

use crate::descriptor::{ConfigurationDescriptor, DfuFunctionalDescriptor, InterfaceSettings};
use crate::protocol::constants::{DEFAULT_TRANSFER_SIZE, DFU_VERSION_1_0, DFUSE_VERSION_NUMBER};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionalProperties {
    pub will_detach: bool,
    pub manifestation_tolerant: bool,
    pub can_upload: bool,
    pub can_download: bool,
    pub transfer_size: u16,
    pub detach_timeout: u16,
    pub dfu_version: u16,
}

impl Default for FunctionalProperties {
    /// Used when the functional descriptor is missing or unreadable.
    fn default() -> Self {
        Self {
            will_detach: true,
            manifestation_tolerant: true,
            can_upload: false,
            can_download: true,
            transfer_size: DEFAULT_TRANSFER_SIZE,
            detach_timeout: 0,
            dfu_version: DFU_VERSION_1_0,
        }
    }
}

impl From<&DfuFunctionalDescriptor> for FunctionalProperties {
    fn from(desc: &DfuFunctionalDescriptor) -> Self {
        Self {
            will_detach: desc.will_detach(),
            manifestation_tolerant: desc.manifestation_tolerant(),
            can_upload: desc.can_upload(),
            can_download: desc.can_download(),
            transfer_size: desc.transfer_size,
            detach_timeout: desc.detach_timeout,
            dfu_version: desc.dfu_version,
        }
    }
}

impl FunctionalProperties {
    /// Functional descriptor of `config` if it is the configuration the
    /// interface belongs to.
    pub fn from_configuration(
        config: &ConfigurationDescriptor,
        settings: &InterfaceSettings,
    ) -> Option<Self> {
        if config.configuration_value != settings.configuration_value {
            return None;
        }
        config
            .functional_descriptor(settings.interface_number(), settings.alternate_setting())
            .map(Self::from)
    }

    /// Transfer size to use for block transfers (never zero).
    pub fn effective_transfer_size(&self) -> u16 {
        if self.transfer_size == 0 {
            DEFAULT_TRANSFER_SIZE
        } else {
            self.transfer_size
        }
    }

    pub fn is_dfuse(&self) -> bool {
        self.dfu_version == DFUSE_VERSION_NUMBER
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{Descriptor, InterfaceDescriptor, find_dfu_interfaces};
    use crate::protocol::constants::DFU_PROTOCOL_DFU_MODE;

    #[test]
    fn test_properties_follow_configuration_value() {
        let func = DfuFunctionalDescriptor::new(0x03, 100, 64, 0x011A);
        let config = ConfigurationDescriptor::new(
            2,
            vec![Descriptor::Interface(InterfaceDescriptor::dfu(
                0,
                0,
                DFU_PROTOCOL_DFU_MODE,
                0,
                Some(func),
            ))],
        );
        let settings = find_dfu_interfaces(std::slice::from_ref(&config)).remove(0);

        let props = FunctionalProperties::from_configuration(&config, &settings).unwrap();
        assert!(props.can_download && props.can_upload);
        assert!(!props.manifestation_tolerant && !props.will_detach);
        assert_eq!(props.transfer_size, 64);
        assert!(props.is_dfuse());

        let mut other = settings.clone();
        other.configuration_value = 1;
        assert!(FunctionalProperties::from_configuration(&config, &other).is_none());
    }

    #[test]
    fn test_defaults() {
        let props = FunctionalProperties::default();
        assert!(props.manifestation_tolerant && props.can_download && props.will_detach);
        assert!(!props.can_upload);
        assert_eq!(props.transfer_size, 1024);
        assert_eq!(props.dfu_version, 0x0100);
        let zero = FunctionalProperties {
            transfer_size: 0,
            ..props
        };
        assert_eq!(zero.effective_transfer_size(), 1024);
    }
}
