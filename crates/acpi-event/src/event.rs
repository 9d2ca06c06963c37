//! ACPI events as delivered on the `acpi_mc_group` multicast group.
//!
//! Each event is an `ACPI_GENL_ATTR_EVENT` attribute holding
//! `struct acpi_genl_event`:
//!
//! ```text
//! [20B device_class][15B bus_id][1B pad][4B type][4B data]
//! ```

use std::fmt;

use crate::netlink::{self, NetlinkError, attributes, c_string, read_u32_at, split_genl};

/// Attribute type carrying an event.
pub const ACPI_GENL_ATTR_EVENT: u16 = 1;

const DEVICE_CLASS_LEN: usize = 20;
const BUS_ID_LEN: usize = 15;
const TYPE_OFFSET: usize = 36;
const DATA_OFFSET: usize = 40;
/// Size of `struct acpi_genl_event`.
pub const EVENT_SIZE: usize = 44;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcpiEvent {
    pub device_class: String,
    pub bus_id: String,
    pub kind: u32,
    pub data: u32,
}

impl AcpiEvent {
    pub fn decode(value: &[u8]) -> Result<Self, NetlinkError> {
        if value.len() < EVENT_SIZE {
            return Err(NetlinkError::BadLength {
                what: "acpi_genl_event",
                len: value.len(),
            });
        }
        let device_class = c_string(value.get(..DEVICE_CLASS_LEN).unwrap_or_default());
        let bus_id = c_string(
            value
                .get(DEVICE_CLASS_LEN..DEVICE_CLASS_LEN + BUS_ID_LEN)
                .unwrap_or_default(),
        );
        let kind = read_u32_at(value, TYPE_OFFSET).ok_or(NetlinkError::Truncated("event type"))?;
        let data = read_u32_at(value, DATA_OFFSET).ok_or(NetlinkError::Truncated("event data"))?;
        Ok(Self {
            device_class,
            bus_id,
            kind,
            data,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; EVENT_SIZE];
        let class = self.device_class.as_bytes();
        let class = class.get(..class.len().min(DEVICE_CLASS_LEN - 1)).unwrap_or_default();
        let bus = self.bus_id.as_bytes();
        let bus = bus.get(..bus.len().min(BUS_ID_LEN - 1)).unwrap_or_default();
        if let Some(dst) = buf.get_mut(..class.len()) {
            dst.copy_from_slice(class);
        }
        if let Some(dst) = buf.get_mut(DEVICE_CLASS_LEN..DEVICE_CLASS_LEN + bus.len()) {
            dst.copy_from_slice(bus);
        }
        if let Some(dst) = buf.get_mut(TYPE_OFFSET..DATA_OFFSET) {
            dst.copy_from_slice(&self.kind.to_ne_bytes());
        }
        if let Some(dst) = buf.get_mut(DATA_OFFSET..EVENT_SIZE) {
            dst.copy_from_slice(&self.data.to_ne_bytes());
        }
        buf
    }
}

/// Same text form as `acpid` uses: `button/power PWRF 00000080 00000001`.
impl fmt::Display for AcpiEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {:08x} {:08x}",
            self.device_class, self.bus_id, self.kind, self.data
        )
    }
}

/// Events in one generic netlink payload (header included).
pub fn events_in(payload: &[u8]) -> Result<Vec<AcpiEvent>, NetlinkError> {
    let (_, attrs) = split_genl(payload)?;
    attributes(attrs)?
        .into_iter()
        .filter(|attr| attr.kind == ACPI_GENL_ATTR_EVENT)
        .map(|attr| AcpiEvent::decode(attr.value))
        .collect()
}

/// Full multicast message as the kernel would send it, for `family_id`.
pub fn encode_event_message(family_id: u16, event: &AcpiEvent) -> Vec<u8> {
    let mut payload = netlink::GenlHeader { cmd: 1, version: 1 }.encode().to_vec();
    netlink::push_attribute(&mut payload, ACPI_GENL_ATTR_EVENT, &event.encode());
    netlink::encode_message(family_id, 0, 0, &payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::decode_messages;

    fn power_button() -> AcpiEvent {
        AcpiEvent {
            device_class: "button/power".into(),
            bus_id: "PWRF".into(),
            kind: 0x80,
            data: 1,
        }
    }

    #[test]
    fn formats_like_acpid() {
        assert_eq!(power_button().to_string(), "button/power PWRF 00000080 00000001");
    }

    #[test]
    fn decodes_kernel_layout() {
        let mut raw = vec![0u8; EVENT_SIZE];
        raw[..12].copy_from_slice(b"button/power");
        raw[20..24].copy_from_slice(b"LNXP");
        raw[36..40].copy_from_slice(&0x80u32.to_ne_bytes());
        raw[40..44].copy_from_slice(&0u32.to_ne_bytes());
        let event = AcpiEvent::decode(&raw).unwrap();
        assert_eq!(event.device_class, "button/power");
        assert_eq!(event.bus_id, "LNXP");
        assert_eq!(event.kind, 0x80);
        assert_eq!(event.data, 0);
    }

    #[test]
    fn short_event_is_rejected() {
        assert!(AcpiEvent::decode(&[0u8; 40]).is_err());
    }

    #[test]
    fn extracts_events_from_multicast_message() {
        let data = encode_event_message(0x1d, &power_button());
        let messages = decode_messages(&data).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].msg_type, 0x1d);
        let events = events_in(&messages[0].payload).unwrap();
        assert_eq!(events, vec![power_button()]);
    }
}
