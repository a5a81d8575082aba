//! Builds raw `AdminMessage` protobuf payloads for the node-settings service
//! (spec.md §4.8). Feature-gated the same way as [`crate::codec`]: without
//! `meshtastic-proto` every builder returns [`ProtocolError::ProtoDisabled`].

use crate::codec::ProtocolError;

/// The ten settings groups the node-settings service exposes Load/Save for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsGroup {
    User,
    Device,
    Position,
    Power,
    Display,
    Bluetooth,
    Lora,
    Security,
    Mqtt,
    RangeTest,
}

/// Owner settings (user) use `GetOwnerRequest`/`SetOwner`; everything else is
/// either a device `Config` or a module `ModuleConfig` sub-message.
enum GroupKind {
    Owner,
    Config,
    ModuleConfig,
}

impl SettingsGroup {
    fn kind(self) -> GroupKind {
        match self {
            SettingsGroup::User => GroupKind::Owner,
            SettingsGroup::Device
            | SettingsGroup::Position
            | SettingsGroup::Power
            | SettingsGroup::Display
            | SettingsGroup::Bluetooth
            | SettingsGroup::Lora
            | SettingsGroup::Security => GroupKind::Config,
            SettingsGroup::Mqtt | SettingsGroup::RangeTest => GroupKind::ModuleConfig,
        }
    }
}

#[cfg(feature = "meshtastic-proto")]
pub use real::*;

#[cfg(feature = "meshtastic-proto")]
mod real {
    use super::{GroupKind, SettingsGroup};
    use crate::codec::ProtocolError;
    use crate::protobuf::meshtastic_generated as proto;
    use prost::Message;

    fn config_type(group: SettingsGroup) -> i32 {
        use proto::admin_message::ConfigType;
        match group {
            SettingsGroup::Device => ConfigType::DeviceConfig as i32,
            SettingsGroup::Position => ConfigType::PositionConfig as i32,
            SettingsGroup::Power => ConfigType::PowerConfig as i32,
            SettingsGroup::Display => ConfigType::DisplayConfig as i32,
            SettingsGroup::Bluetooth => ConfigType::BluetoothConfig as i32,
            SettingsGroup::Lora => ConfigType::LoraConfig as i32,
            SettingsGroup::Security => ConfigType::SecurityConfig as i32,
            _ => ConfigType::DeviceConfig as i32,
        }
    }

    fn module_config_type(group: SettingsGroup) -> i32 {
        use proto::admin_message::ModuleConfigType;
        match group {
            SettingsGroup::Mqtt => ModuleConfigType::MqttConfig as i32,
            SettingsGroup::RangeTest => ModuleConfigType::RangetestConfig as i32,
            _ => ModuleConfigType::MqttConfig as i32,
        }
    }

    fn wrap(variant: proto::admin_message::PayloadVariant) -> Vec<u8> {
        proto::AdminMessage {
            payload_variant: Some(variant),
        }
        .encode_to_vec()
    }

    pub fn get_request(group: SettingsGroup) -> Result<Vec<u8>, ProtocolError> {
        Ok(match group.kind() {
            GroupKind::Owner => wrap(proto::admin_message::PayloadVariant::GetOwnerRequest(true)),
            GroupKind::Config => wrap(proto::admin_message::PayloadVariant::GetConfigRequest(config_type(group))),
            GroupKind::ModuleConfig => wrap(proto::admin_message::PayloadVariant::GetModuleConfigRequest(
                module_config_type(group),
            )),
        })
    }

    pub fn begin_edit_settings() -> Result<Vec<u8>, ProtocolError> {
        Ok(wrap(proto::admin_message::PayloadVariant::BeginEditSettings(true)))
    }

    pub fn commit_edit_settings() -> Result<Vec<u8>, ProtocolError> {
        Ok(wrap(proto::admin_message::PayloadVariant::CommitEditSettings(true)))
    }

    pub fn set_owner(raw_user: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let user = proto::User::decode(raw_user).map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(wrap(proto::admin_message::PayloadVariant::SetOwner(user)))
    }

    /// `raw_config`/`raw_module_config` are the encoded `Config`/`ModuleConfig`
    /// sub-message bytes produced by the settings UI for the selected group.
    pub fn set_config(raw_config: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let config = proto::Config::decode(raw_config).map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(wrap(proto::admin_message::PayloadVariant::SetConfig(config)))
    }

    pub fn set_module_config(raw_module_config: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let config = proto::ModuleConfig::decode(raw_module_config).map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(wrap(proto::admin_message::PayloadVariant::SetModuleConfig(config)))
    }

    pub fn set_fixed_position(lat: f64, lon: f64, altitude: i32) -> Result<Vec<u8>, ProtocolError> {
        let position = proto::Position {
            latitude_i: (lat * 1e7).round() as i32,
            longitude_i: (lon * 1e7).round() as i32,
            altitude,
            ..Default::default()
        };
        Ok(wrap(proto::admin_message::PayloadVariant::SetFixedPosition(position)))
    }

    pub fn remove_fixed_position() -> Result<Vec<u8>, ProtocolError> {
        Ok(wrap(proto::admin_message::PayloadVariant::RemoveFixedPosition(true)))
    }
}

#[cfg(not(feature = "meshtastic-proto"))]
pub fn get_request(_group: SettingsGroup) -> Result<Vec<u8>, ProtocolError> {
    Err(ProtocolError::ProtoDisabled)
}

#[cfg(not(feature = "meshtastic-proto"))]
pub fn begin_edit_settings() -> Result<Vec<u8>, ProtocolError> {
    Err(ProtocolError::ProtoDisabled)
}

#[cfg(not(feature = "meshtastic-proto"))]
pub fn commit_edit_settings() -> Result<Vec<u8>, ProtocolError> {
    Err(ProtocolError::ProtoDisabled)
}

#[cfg(not(feature = "meshtastic-proto"))]
pub fn set_owner(_raw_user: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    Err(ProtocolError::ProtoDisabled)
}

#[cfg(not(feature = "meshtastic-proto"))]
pub fn set_config(_raw_config: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    Err(ProtocolError::ProtoDisabled)
}

#[cfg(not(feature = "meshtastic-proto"))]
pub fn set_module_config(_raw_module_config: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    Err(ProtocolError::ProtoDisabled)
}

#[cfg(not(feature = "meshtastic-proto"))]
pub fn set_fixed_position(_lat: f64, _lon: f64, _altitude: i32) -> Result<Vec<u8>, ProtocolError> {
    Err(ProtocolError::ProtoDisabled)
}

#[cfg(not(feature = "meshtastic-proto"))]
pub fn remove_fixed_position() -> Result<Vec<u8>, ProtocolError> {
    Err(ProtocolError::ProtoDisabled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_group_kind_partitions_correctly() {
        assert!(matches!(SettingsGroup::User.kind(), GroupKind::Owner));
        assert!(matches!(SettingsGroup::Lora.kind(), GroupKind::Config));
        assert!(matches!(SettingsGroup::Mqtt.kind(), GroupKind::ModuleConfig));
    }
}
