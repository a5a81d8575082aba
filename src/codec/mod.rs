//! # Meshtastic Codec
//!
//! Stateful encoder/decoder for the Meshtastic framed protobuf protocol
//! (spec.md §4.3). All mutable state is a handful of atomics — no locks —
//! because the codec is shared between the outbound worker and the reader
//! loop without ever needing a critical section spanning more than one field.
//!
//! Encoding and decoding against the real wire format require the generated
//! protobuf types in [`crate::protobuf::meshtastic_generated`], available
//! when the `meshtastic-proto` feature is enabled and real `.proto` sources
//! are supplied at build time (spec.md treats the schema itself as an
//! external asset). Without the feature, the encode/decode entry points
//! return a `ProtocolError::ProtoDisabled`, mirroring the teacher's text-only
//! fallback mode in `meshtastic::MeshtasticDevice`.

use std::sync::atomic::{AtomicU32, Ordering};

use chrono::Utc;
use thiserror::Error;

use crate::bus::{
    AdminMessageEvent, Channel, DecodedFrame as BusDecodedFrame, DiscoverySource, MessageStatus,
    MessageStatusUpdate, NodeDiscovered, NodeUpdate, NodeUpdateKind, TracerouteEvent,
};
use crate::store::{ChatMessage, Direction, Node};
use crate::validation::{self, channel_chat_key, dm_chat_key, format_node_id, ChatTarget};

pub const BROADCAST_NUM: u32 = 0xFFFF_FFFF;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("meshtastic-proto feature not enabled")]
    ProtoDisabled,
    #[error("failed to decode frame: {0}")]
    Decode(String),
    #[error("invalid chat key: {0}")]
    InvalidChatKey(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModemPreset {
    LongFast,
    LongSlow,
    ShortFast,
    ShortSlow,
    MediumFast,
    MediumSlow,
    LongModerate,
}

impl ModemPreset {
    pub fn default_title(self) -> &'static str {
        match self {
            ModemPreset::LongFast => "LongFast",
            ModemPreset::LongSlow => "LongSlow",
            ModemPreset::ShortFast => "ShortFast",
            ModemPreset::ShortSlow => "ShortSlow",
            ModemPreset::MediumFast => "MediumFast",
            ModemPreset::MediumSlow => "MediumSlow",
            ModemPreset::LongModerate => "LongModerate",
        }
    }

    fn from_wire(v: i32) -> Self {
        match v {
            1 => ModemPreset::LongSlow,
            2 => ModemPreset::ShortSlow,
            3 => ModemPreset::ShortFast,
            4 => ModemPreset::MediumSlow,
            5 => ModemPreset::MediumFast,
            8 => ModemPreset::LongModerate,
            _ => ModemPreset::LongFast,
        }
    }

    fn to_atomic(self) -> u32 {
        match self {
            ModemPreset::LongFast => 0,
            ModemPreset::LongSlow => 1,
            ModemPreset::ShortSlow => 2,
            ModemPreset::ShortFast => 3,
            ModemPreset::MediumSlow => 4,
            ModemPreset::MediumFast => 5,
            ModemPreset::LongModerate => 6,
        }
    }

    fn from_atomic(v: u32) -> Self {
        match v {
            1 => ModemPreset::LongSlow,
            2 => ModemPreset::ShortSlow,
            3 => ModemPreset::ShortFast,
            4 => ModemPreset::MediumSlow,
            5 => ModemPreset::MediumFast,
            6 => ModemPreset::LongModerate,
            _ => ModemPreset::LongFast,
        }
    }
}

/// Result of [`Codec::encode_text`]: the payload to write, plus correlation
/// data the outbound worker needs to track the send.
pub struct EncodedSend {
    pub bytes: Vec<u8>,
    pub device_message_id: String,
    pub target_node_num: u32,
    pub want_ack: bool,
}

/// Everything a single `DecodeFromRadio` call may produce (spec.md §4.3).
#[derive(Default)]
pub struct DecodeOutput {
    pub frame: BusDecodedFrame,
    pub node_update: Option<NodeUpdate>,
    pub node_discovered: Option<NodeDiscovered>,
    pub channel: Option<Channel>,
    pub config_snapshot: Option<Vec<Channel>>,
    pub chat_message: Option<ChatMessage>,
    pub admin_event: Option<AdminMessageEvent>,
    pub traceroute_event: Option<TracerouteEvent>,
    pub message_status: Option<MessageStatusUpdate>,
}

/// Stateful Meshtastic codec (spec.md §4.3). Cheap to clone: all state lives
/// behind `Arc`-shared atomics once wrapped by the radio service.
pub struct Codec {
    want_config_id: AtomicU32,
    packet_id: AtomicU32,
    local_node_num: AtomicU32,
    modem_preset: AtomicU32,
}

impl Codec {
    pub fn new() -> Self {
        let seed = rand::random::<u32>();
        Self {
            want_config_id: AtomicU32::new(0),
            packet_id: AtomicU32::new(if seed == 0 { 1 } else { seed }),
            local_node_num: AtomicU32::new(0),
            modem_preset: AtomicU32::new(ModemPreset::LongFast.to_atomic()),
        }
    }

    pub fn local_node_num(&self) -> u32 {
        self.local_node_num.load(Ordering::SeqCst)
    }

    pub fn modem_preset(&self) -> ModemPreset {
        ModemPreset::from_atomic(self.modem_preset.load(Ordering::SeqCst))
    }

    /// Allocate the next non-zero packet id (spec.md §4.3 "skip zero").
    fn next_packet_id(&self) -> u32 {
        loop {
            let id = self.packet_id.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    pub fn encode_want_config(&self) -> Result<(Vec<u8>, u32), ProtocolError> {
        let id = self.next_packet_id();
        self.want_config_id.store(id, Ordering::SeqCst);
        let bytes = encode_impl::want_config(id)?;
        Ok((bytes, id))
    }

    pub fn encode_heartbeat(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_impl::heartbeat()
    }

    /// `channel:<n>` -> broadcast, no ack. `dm:!<hex>` -> direct, ack requested.
    pub fn encode_text(&self, chat_key: &str, text: &str) -> Result<EncodedSend, ProtocolError> {
        validation::validate_text(text)?;
        let target = validation::validate_chat_key(chat_key)?;
        let id = self.next_packet_id();
        let (to, channel, want_ack) = match target {
            ChatTarget::Channel(idx) => (BROADCAST_NUM, idx, false),
            ChatTarget::Dm(num) => (num, 0, true),
        };
        let bytes = encode_impl::text_message(id, to, channel, want_ack, text)?;
        Ok(EncodedSend {
            bytes,
            device_message_id: id.to_string(),
            target_node_num: to,
            want_ack,
        })
    }

    pub fn encode_admin(
        &self,
        to: u32,
        channel: u32,
        want_response: bool,
        admin_payload: &[u8],
    ) -> Result<EncodedSend, ProtocolError> {
        let id = self.next_packet_id();
        let bytes = encode_impl::admin(id, to, channel, want_response, admin_payload)?;
        Ok(EncodedSend {
            bytes,
            device_message_id: id.to_string(),
            target_node_num: to,
            want_ack: true,
        })
    }

    pub fn encode_traceroute(&self, to: u32, channel: u32) -> Result<EncodedSend, ProtocolError> {
        let id = self.next_packet_id();
        let bytes = encode_impl::traceroute(id, to, channel)?;
        Ok(EncodedSend {
            bytes,
            device_message_id: id.to_string(),
            target_node_num: to,
            want_ack: true,
        })
    }

    /// Decode a `FromRadio` frame, updating local state as a side effect
    /// (spec.md §4.3 Decoding).
    pub fn decode_from_radio(&self, bytes: &[u8]) -> Result<DecodeOutput, ProtocolError> {
        let raw = decode_impl::parse(bytes)?;
        let mut out = DecodeOutput::default();

        if let Some(my_node_num) = raw.my_node_num {
            if my_node_num != 0 {
                self.local_node_num.store(my_node_num, Ordering::SeqCst);
            }
        }
        if let Some(preset) = raw.modem_preset {
            self.modem_preset
                .store(ModemPreset::from_wire(preset).to_atomic(), Ordering::SeqCst);
        }
        if let Some(id) = raw.config_complete_id {
            out.frame.config_complete_id = Some(id);
            if id == self.want_config_id.load(Ordering::SeqCst) {
                out.frame.want_config_ready = true;
            }
        }
        if let Some(node) = raw.node_info {
            out.node_discovered = Some(NodeDiscovered {
                node: node.clone(),
                discovered_at: Utc::now(),
                source: DiscoverySource::ConfigScan,
            });
            out.node_update = Some(NodeUpdate {
                kind: NodeUpdateKind::ConfigPhase,
                node,
            });
        }
        if let Some((channel, is_first)) = raw.channel {
            let title = if channel.title.is_empty() {
                format!("Channel {}", channel.index)
            } else {
                channel.title.clone()
            };
            let resolved = Channel {
                index: channel.index,
                title: if channel.title.is_empty() {
                    self.modem_preset().default_title().to_string()
                } else {
                    title
                },
            };
            out.channel = Some(resolved.clone());
            if is_first {
                out.config_snapshot = Some(vec![resolved]);
            }
        }
        if let Some(qs) = raw.queue_status {
            if qs.packet_id != 0 {
                out.message_status = Some(MessageStatusUpdate {
                    device_message_id: qs.packet_id.to_string(),
                    status: if qs.failed {
                        MessageStatus::Failed
                    } else {
                        MessageStatus::Sent
                    },
                    reason: qs.reason,
                    from_node_num: 0,
                });
            }
        }
        if let Some(packet) = raw.mesh_packet {
            self.apply_mesh_packet(packet, &mut out);
        }

        Ok(out)
    }

    fn apply_mesh_packet(&self, packet: decode_impl::RawMeshPacket, out: &mut DecodeOutput) {
        let local = self.local_node_num();
        match packet.port {
            decode_impl::Port::Text => {
                let direction = if packet.from == local { Direction::Out } else { Direction::In };
                let chat_key = if packet.to == BROADCAST_NUM {
                    channel_chat_key(packet.channel)
                } else if direction == Direction::Out {
                    dm_chat_key(packet.to)
                } else {
                    dm_chat_key(packet.from)
                };
                let status = if direction == Direction::In {
                    MessageStatus::Sent
                } else if packet.want_ack {
                    MessageStatus::Pending
                } else {
                    MessageStatus::Sent
                };
                let meta_json = Some(packet.meta_json());
                out.chat_message = Some(ChatMessage {
                    local_id: 0,
                    device_message_id: packet.id.to_string(),
                    chat_key,
                    direction,
                    body: packet.text.unwrap_or_default(),
                    status: status.into(),
                    status_reason: None,
                    at: Utc::now().timestamp_millis(),
                    meta_json,
                });
            }
            decode_impl::Port::NodeInfo => {
                if let Some(node) = packet.node_info {
                    out.node_update = Some(NodeUpdate {
                        kind: NodeUpdateKind::NodeInfoPacket,
                        node,
                    });
                }
            }
            decode_impl::Port::Telemetry => {
                if let Some(node) = packet.telemetry_node {
                    out.node_update = Some(NodeUpdate {
                        kind: NodeUpdateKind::TelemetryPacket,
                        node,
                    });
                }
            }
            decode_impl::Port::Position => {
                if let Some(node) = packet.position_node {
                    out.node_update = Some(NodeUpdate {
                        kind: NodeUpdateKind::PositionPacket,
                        node,
                    });
                }
            }
            decode_impl::Port::Admin => {
                if let Some(admin) = packet.admin {
                    out.admin_event = Some(AdminMessageEvent {
                        from: packet.from,
                        to: packet.to,
                        packet_id: packet.id,
                        request_id: admin.request_id,
                        reply_id: admin.reply_id,
                        payload: admin.payload,
                    });
                }
            }
            decode_impl::Port::Traceroute => {
                // A packet carrying its own response request is not itself a
                // response; skip it (spec.md §9 open question, preserved).
                if packet.want_response {
                    return;
                }
                if let Some(tr) = packet.traceroute {
                    let mut forward_route = vec![packet.to];
                    forward_route.extend(tr.route.iter().copied());
                    forward_route.push(packet.from);
                    let has_return = !tr.snr_back.is_empty() || tr.route_back_explicit;
                    let return_route = if has_return {
                        let mut r = vec![packet.from];
                        r.extend(tr.route_back.iter().copied());
                        r.push(packet.to);
                        r
                    } else {
                        tr.route_back.clone()
                    };
                    let is_complete = !forward_route.is_empty() && !return_route.is_empty();
                    out.traceroute_event = Some(TracerouteEvent {
                        request_id: packet.id,
                        forward_route,
                        forward_snr: tr.snr_towards,
                        return_route,
                        return_snr: tr.snr_back,
                        is_complete,
                    });
                }
            }
            decode_impl::Port::Routing => {
                if packet.request_id != 0 {
                    out.message_status = Some(MessageStatusUpdate {
                        device_message_id: packet.request_id.to_string(),
                        status: if packet.routing_error.is_some() {
                            MessageStatus::Failed
                        } else {
                            MessageStatus::Acked
                        },
                        reason: packet.routing_error,
                        from_node_num: packet.from,
                    });
                }
            }
            decode_impl::Port::Other => {}
        }
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

/// Wire-format helpers. Gated: with the `meshtastic-proto` feature and real
/// `.proto` sources, these delegate to the generated prost types; otherwise
/// every call returns [`ProtocolError::ProtoDisabled`].
#[cfg(feature = "meshtastic-proto")]
mod encode_impl {
    use super::ProtocolError;
    use crate::protobuf::meshtastic_generated as proto;
    use prost::Message;

    pub fn want_config(id: u32) -> Result<Vec<u8>, ProtocolError> {
        let to_radio = proto::ToRadio {
            payload_variant: Some(proto::to_radio::PayloadVariant::WantConfigId(id)),
        };
        Ok(to_radio.encode_to_vec())
    }

    pub fn heartbeat() -> Result<Vec<u8>, ProtocolError> {
        let to_radio = proto::ToRadio {
            payload_variant: Some(proto::to_radio::PayloadVariant::Heartbeat(proto::Heartbeat {})),
        };
        Ok(to_radio.encode_to_vec())
    }

    fn wrap_packet(id: u32, to: u32, channel: u32, want_ack: bool, priority: i32, payload: proto::Data) -> Vec<u8> {
        let packet = proto::MeshPacket {
            id,
            to,
            channel,
            want_ack,
            priority,
            payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(payload)),
            ..Default::default()
        };
        let to_radio = proto::ToRadio {
            payload_variant: Some(proto::to_radio::PayloadVariant::Packet(packet)),
        };
        to_radio.encode_to_vec()
    }

    pub fn text_message(
        id: u32,
        to: u32,
        channel: u32,
        want_ack: bool,
        text: &str,
    ) -> Result<Vec<u8>, ProtocolError> {
        let priority = if want_ack { 70 } else { 0 };
        let payload = proto::Data {
            portnum: proto::PortNum::TextMessageApp as i32,
            payload: text.as_bytes().to_vec(),
            ..Default::default()
        };
        Ok(wrap_packet(id, to, channel, want_ack, priority, payload))
    }

    pub fn admin(
        id: u32,
        to: u32,
        channel: u32,
        want_response: bool,
        admin_payload: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        let payload = proto::Data {
            portnum: proto::PortNum::AdminApp as i32,
            payload: admin_payload.to_vec(),
            want_response,
            ..Default::default()
        };
        Ok(wrap_packet(id, to, channel, true, 70, payload))
    }

    pub fn traceroute(id: u32, to: u32, channel: u32) -> Result<Vec<u8>, ProtocolError> {
        let route_discovery = proto::RouteDiscovery::default();
        let payload = proto::Data {
            portnum: proto::PortNum::TracerouteApp as i32,
            payload: route_discovery.encode_to_vec(),
            want_response: true,
            ..Default::default()
        };
        Ok(wrap_packet(id, to, channel, true, 70, payload))
    }
}

#[cfg(not(feature = "meshtastic-proto"))]
mod encode_impl {
    use super::ProtocolError;

    pub fn want_config(_id: u32) -> Result<Vec<u8>, ProtocolError> {
        Err(ProtocolError::ProtoDisabled)
    }
    pub fn heartbeat() -> Result<Vec<u8>, ProtocolError> {
        Err(ProtocolError::ProtoDisabled)
    }
    pub fn text_message(_id: u32, _to: u32, _channel: u32, _want_ack: bool, _text: &str) -> Result<Vec<u8>, ProtocolError> {
        Err(ProtocolError::ProtoDisabled)
    }
    pub fn admin(_id: u32, _to: u32, _channel: u32, _want_response: bool, _payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        Err(ProtocolError::ProtoDisabled)
    }
    pub fn traceroute(_id: u32, _to: u32, _channel: u32) -> Result<Vec<u8>, ProtocolError> {
        Err(ProtocolError::ProtoDisabled)
    }
}

/// Intermediate, feature-agnostic decode representation. The `#[cfg]`'d
/// `parse` function below is the only thing that needs to change to target
/// the real generated types; everything in [`Codec`] operates on this shape.
mod decode_impl {
    use crate::store::Node;

    #[derive(Default)]
    pub struct RawFromRadio {
        pub my_node_num: Option<u32>,
        pub modem_preset: Option<i32>,
        pub config_complete_id: Option<u32>,
        pub node_info: Option<Node>,
        pub channel: Option<(RawChannel, bool)>,
        pub queue_status: Option<RawQueueStatus>,
        pub mesh_packet: Option<RawMeshPacket>,
    }

    pub struct RawChannel {
        pub index: u32,
        pub title: String,
    }

    pub struct RawQueueStatus {
        pub packet_id: u32,
        pub failed: bool,
        pub reason: Option<String>,
    }

    #[derive(Clone, Copy, PartialEq, Eq)]
    pub enum Port {
        Text,
        NodeInfo,
        Telemetry,
        Position,
        Admin,
        Traceroute,
        Routing,
        Other,
    }

    pub struct RawAdmin {
        pub request_id: u32,
        pub reply_id: u32,
        pub payload: Vec<u8>,
    }

    #[derive(Default)]
    pub struct RawTraceroute {
        pub route: Vec<u32>,
        pub snr_towards: Vec<f32>,
        pub route_back: Vec<u32>,
        pub snr_back: Vec<f32>,
        pub route_back_explicit: bool,
    }

    pub struct RawMeshPacket {
        pub id: u32,
        pub from: u32,
        pub to: u32,
        pub channel: u32,
        pub want_ack: bool,
        pub want_response: bool,
        pub request_id: u32,
        pub port: Port,
        pub text: Option<String>,
        pub node_info: Option<Node>,
        pub telemetry_node: Option<Node>,
        pub position_node: Option<Node>,
        pub admin: Option<RawAdmin>,
        pub traceroute: Option<RawTraceroute>,
        pub routing_error: Option<String>,
        pub hop_start: Option<u32>,
        pub hop_limit: Option<u32>,
        pub rssi: Option<i32>,
        pub snr: Option<f32>,
        pub via_mqtt: bool,
    }

    impl RawMeshPacket {
        pub fn meta_json(&self) -> String {
            format!(
                "{{\"hop_start\":{},\"hop_limit\":{},\"rssi\":{},\"snr\":{},\"via_mqtt\":{}}}",
                self.hop_start.map(|v| v.to_string()).unwrap_or_else(|| "null".into()),
                self.hop_limit.map(|v| v.to_string()).unwrap_or_else(|| "null".into()),
                self.rssi.map(|v| v.to_string()).unwrap_or_else(|| "null".into()),
                self.snr.map(|v| v.to_string()).unwrap_or_else(|| "null".into()),
                self.via_mqtt,
            )
        }
    }

    #[cfg(feature = "meshtastic-proto")]
    pub fn parse(bytes: &[u8]) -> Result<RawFromRadio, super::ProtocolError> {
        use crate::protobuf::meshtastic_generated as proto;
        use prost::Message;

        let from_radio = proto::FromRadio::decode(bytes)
            .map_err(|e| super::ProtocolError::Decode(e.to_string()))?;
        let mut out = RawFromRadio::default();

        match from_radio.payload_variant {
            Some(proto::from_radio::PayloadVariant::MyInfo(info)) => {
                out.my_node_num = Some(info.my_node_num);
            }
            Some(proto::from_radio::PayloadVariant::Config(cfg)) => {
                if let Some(proto::config::PayloadVariant::Lora(lora)) = cfg.payload_variant {
                    out.modem_preset = Some(lora.modem_preset);
                }
            }
            Some(proto::from_radio::PayloadVariant::ConfigCompleteId(id)) => {
                out.config_complete_id = Some(id);
            }
            Some(proto::from_radio::PayloadVariant::NodeInfo(ni)) => {
                out.node_info = Some(node_from_nodeinfo(&ni));
            }
            Some(proto::from_radio::PayloadVariant::Channel(ch)) => {
                if ch.role != proto::channel::Role::Disabled as i32 {
                    let title = ch
                        .settings
                        .as_ref()
                        .map(|s| s.name.clone())
                        .unwrap_or_default();
                    out.channel = Some((
                        RawChannel {
                            index: ch.index as u32,
                            title,
                        },
                        true,
                    ));
                }
            }
            Some(proto::from_radio::PayloadVariant::QueueStatus(qs)) => {
                out.queue_status = Some(RawQueueStatus {
                    packet_id: qs.mesh_packet_id,
                    failed: qs.res != 0,
                    reason: if qs.res != 0 {
                        Some(format!("queue status code {}", qs.res))
                    } else {
                        None
                    },
                });
            }
            Some(proto::from_radio::PayloadVariant::Packet(packet)) => {
                out.mesh_packet = Some(mesh_packet_from_proto(packet));
            }
            _ => {}
        }

        Ok(out)
    }

    #[cfg(feature = "meshtastic-proto")]
    fn node_from_nodeinfo(ni: &crate::protobuf::meshtastic_generated::NodeInfo) -> Node {
        let user = ni.user.clone().unwrap_or_default();
        Node {
            node_id: super::format_node_id(ni.num),
            node_num: ni.num,
            long_name: user.long_name,
            short_name: user.short_name,
            board_model: format!("{:?}", user.hw_model),
            role: format!("{:?}", user.role),
            channel: Some(ni.channel),
            is_unmessageable: user.is_unmessageable,
            last_heard_at: (ni.last_heard as i64) * 1000,
            snr: Some(ni.snr),
            ..Default::default()
        }
    }

    #[cfg(feature = "meshtastic-proto")]
    fn mesh_packet_from_proto(packet: crate::protobuf::meshtastic_generated::MeshPacket) -> RawMeshPacket {
        use crate::protobuf::meshtastic_generated as proto;

        let decoded = match &packet.payload_variant {
            Some(proto::mesh_packet::PayloadVariant::Decoded(d)) => Some(d.clone()),
            _ => None,
        };
        let port = decoded
            .as_ref()
            .map(|d| port_from_num(d.portnum))
            .unwrap_or(Port::Other);

        let mut raw = RawMeshPacket {
            id: packet.id,
            from: packet.from,
            to: packet.to,
            channel: packet.channel,
            want_ack: packet.want_ack,
            want_response: decoded.as_ref().map(|d| d.want_response).unwrap_or(false),
            request_id: decoded.as_ref().map(|d| d.request_id).unwrap_or(0),
            port,
            text: None,
            node_info: None,
            telemetry_node: None,
            position_node: None,
            admin: None,
            traceroute: None,
            routing_error: None,
            hop_start: Some(packet.hop_start),
            hop_limit: Some(packet.hop_limit),
            rssi: Some(packet.rx_rssi),
            snr: Some(packet.rx_snr),
            via_mqtt: packet.via_mqtt,
        };

        if let Some(d) = decoded {
            match port {
                Port::Text => {
                    raw.text = String::from_utf8(d.payload.clone()).ok();
                }
                Port::NodeInfo => {
                    if let Ok(user) = proto::User::decode(d.payload.as_slice()) {
                        raw.node_info = Some(Node {
                            node_id: super::format_node_id(packet.from),
                            node_num: packet.from,
                            long_name: user.long_name,
                            short_name: user.short_name,
                            board_model: format!("{:?}", user.hw_model),
                            role: format!("{:?}", user.role),
                            is_unmessageable: user.is_unmessageable,
                            last_heard_at: chrono::Utc::now().timestamp_millis(),
                            ..Default::default()
                        });
                    }
                }
                Port::Telemetry => {
                    if let Ok(t) = proto::Telemetry::decode(d.payload.as_slice()) {
                        raw.telemetry_node = Some(node_from_telemetry(packet.from, &t));
                    }
                }
                Port::Position => {
                    if let Ok(p) = proto::Position::decode(d.payload.as_slice()) {
                        if p.latitude_i != 0 && p.longitude_i != 0 {
                            raw.position_node = Some(Node {
                                node_id: super::format_node_id(packet.from),
                                node_num: packet.from,
                                latitude: Some(p.latitude_i as f64 * 1e-7),
                                longitude: Some(p.longitude_i as f64 * 1e-7),
                                altitude: Some(p.altitude),
                                last_heard_at: chrono::Utc::now().timestamp_millis(),
                                ..Default::default()
                            });
                        }
                    }
                }
                Port::Admin => {
                    raw.admin = Some(RawAdmin {
                        request_id: d.request_id,
                        reply_id: d.reply_id,
                        payload: d.payload.clone(),
                    });
                }
                Port::Traceroute => {
                    if let Ok(rd) = proto::RouteDiscovery::decode(d.payload.as_slice()) {
                        raw.traceroute = Some(RawTraceroute {
                            route: rd.route,
                            snr_towards: rd.snr_towards.iter().map(|s| *s as f32 / 4.0).collect(),
                            route_back: rd.route_back,
                            snr_back: rd.snr_back.iter().map(|s| *s as f32 / 4.0).collect(),
                            route_back_explicit: !rd.route_back.is_empty(),
                        });
                    }
                }
                Port::Routing => {
                    if let Ok(r) = proto::Routing::decode(d.payload.as_slice()) {
                        if let Some(proto::routing::Variant::ErrorReason(code)) = r.variant {
                            if code != 0 {
                                raw.routing_error = Some(format!("routing error code {}", code));
                            }
                        }
                    }
                }
                Port::Other => {}
            }
        }

        raw
    }

    #[cfg(feature = "meshtastic-proto")]
    fn node_from_telemetry(from: u32, t: &crate::protobuf::meshtastic_generated::Telemetry) -> Node {
        use crate::protobuf::meshtastic_generated as proto;
        let mut node = Node {
            node_id: super::format_node_id(from),
            node_num: from,
            last_heard_at: chrono::Utc::now().timestamp_millis(),
            ..Default::default()
        };
        match &t.variant {
            Some(proto::telemetry::Variant::DeviceMetrics(m)) => {
                node.battery_level = Some(m.battery_level);
                node.voltage = Some(m.voltage);
            }
            Some(proto::telemetry::Variant::EnvironmentMetrics(m)) => {
                node.temperature = Some(m.temperature);
                node.humidity = Some(m.relative_humidity);
                node.pressure = Some(m.barometric_pressure);
            }
            Some(proto::telemetry::Variant::PowerMetrics(m)) => {
                node.power_voltage = Some(m.ch1_voltage);
                node.power_current = Some(m.ch1_current);
            }
            Some(proto::telemetry::Variant::AirQualityMetrics(m)) => {
                node.air_quality_index = Some(m.pm25_standard);
            }
            _ => {}
        }
        node
    }

    #[cfg(feature = "meshtastic-proto")]
    fn port_from_num(n: i32) -> Port {
        use crate::protobuf::meshtastic_generated::PortNum;
        match n {
            x if x == PortNum::TextMessageApp as i32 => Port::Text,
            x if x == PortNum::TextMessageCompressedApp as i32 => Port::Text,
            x if x == PortNum::DetectionSensorApp as i32 => Port::Text,
            x if x == PortNum::AlertApp as i32 => Port::Text,
            x if x == PortNum::NodeinfoApp as i32 => Port::NodeInfo,
            x if x == PortNum::TelemetryApp as i32 => Port::Telemetry,
            x if x == PortNum::PositionApp as i32 => Port::Position,
            x if x == PortNum::AdminApp as i32 => Port::Admin,
            x if x == PortNum::TracerouteApp as i32 => Port::Traceroute,
            x if x == PortNum::RoutingApp as i32 => Port::Routing,
            _ => Port::Other,
        }
    }

    #[cfg(not(feature = "meshtastic-proto"))]
    pub fn parse(_bytes: &[u8]) -> Result<RawFromRadio, super::ProtocolError> {
        Err(super::ProtocolError::ProtoDisabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_ids_never_zero_and_increase() {
        let codec = Codec::new();
        let mut prev = 0u32;
        for _ in 0..10 {
            let id = codec.next_packet_id();
            assert_ne!(id, 0);
            if prev != 0 {
                assert_ne!(id, prev);
            }
            prev = id;
        }
    }

    #[test]
    fn modem_preset_defaults_to_long_fast() {
        let codec = Codec::new();
        assert_eq!(codec.modem_preset(), ModemPreset::LongFast);
        assert_eq!(codec.modem_preset().default_title(), "LongFast");
    }

    #[cfg(not(feature = "meshtastic-proto"))]
    #[test]
    fn encode_without_proto_feature_errors() {
        let codec = Codec::new();
        assert!(matches!(
            codec.encode_heartbeat(),
            Err(ProtocolError::ProtoDisabled)
        ));
    }
}
