//! Generic netlink wire format.
//!
//! ## Wire Format
//!
//! ```text
//! nlmsghdr  [4B len][2B type][2B flags][4B seq][4B pid]
//! genlmsghdr[1B cmd][1B version][2B reserved]
//! nlattr    [2B len][2B type][value][pad to 4]
//! ```
//!
//! All integers are in host byte order. `len` fields include their own
//! header but not the trailing alignment padding.

/// Netlink message header size.
pub const NLMSG_HDRLEN: usize = 16;

/// Generic netlink header size.
pub const GENL_HDRLEN: usize = 4;

/// Attribute header size.
pub const NLA_HDRLEN: usize = 4;

const NLA_ALIGNTO: usize = 4;
const NLA_F_NESTED: u16 = 0x8000;
const NLA_F_NET_BYTEORDER: u16 = 0x4000;

pub const NLM_F_REQUEST: u16 = 0x1;

pub const NLMSG_NOOP: u16 = 0x1;
pub const NLMSG_ERROR: u16 = 0x2;
pub const NLMSG_DONE: u16 = 0x3;

/// Message type of the generic netlink controller.
pub const GENL_ID_CTRL: u16 = 0x10;
pub const CTRL_CMD_NEWFAMILY: u8 = 1;
pub const CTRL_CMD_GETFAMILY: u8 = 3;
const CTRL_VERSION: u8 = 1;

pub const CTRL_ATTR_FAMILY_ID: u16 = 1;
pub const CTRL_ATTR_FAMILY_NAME: u16 = 2;
pub const CTRL_ATTR_MCAST_GROUPS: u16 = 7;
pub const CTRL_ATTR_MCAST_GRP_NAME: u16 = 1;
pub const CTRL_ATTR_MCAST_GRP_ID: u16 = 2;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetlinkError {
    #[error("truncated {0}")]
    Truncated(&'static str),

    #[error("bad length {len} in {what}")]
    BadLength { what: &'static str, len: usize },

    #[error("missing attribute {0}")]
    MissingAttribute(&'static str),
}

fn read_u16_at(data: &[u8], offset: usize) -> Option<u16> {
    let bytes: [u8; 2] = data.get(offset..offset + 2)?.try_into().ok()?;
    Some(u16::from_ne_bytes(bytes))
}

pub(crate) fn read_u32_at(data: &[u8], offset: usize) -> Option<u32> {
    let bytes: [u8; 4] = data.get(offset..offset + 4)?.try_into().ok()?;
    Some(u32::from_ne_bytes(bytes))
}

fn read_i32_at(data: &[u8], offset: usize) -> Option<i32> {
    let bytes: [u8; 4] = data.get(offset..offset + 4)?.try_into().ok()?;
    Some(i32::from_ne_bytes(bytes))
}

fn align(len: usize) -> usize {
    (len + NLA_ALIGNTO - 1) & !(NLA_ALIGNTO - 1)
}

/// Bytes up to the first NUL, decoded lossily.
pub(crate) fn c_string(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(data.get(..end).unwrap_or(data)).into_owned()
}

/// One netlink message with its header fields and the payload following
/// the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: u16,
    pub flags: u16,
    pub seq: u32,
    pub pid: u32,
    pub payload: Vec<u8>,
}

impl Message {
    /// Kernel errno carried by an `NLMSG_ERROR` message. Zero is an ack.
    pub fn error_code(&self) -> Option<i32> {
        if self.msg_type != NLMSG_ERROR {
            return None;
        }
        read_i32_at(&self.payload, 0)
    }
}

/// Encode a single message: header followed by `payload`.
pub fn encode_message(msg_type: u16, flags: u16, seq: u32, payload: &[u8]) -> Vec<u8> {
    let len = NLMSG_HDRLEN + payload.len();
    let mut buf = Vec::with_capacity(align(len));
    buf.extend_from_slice(&(len as u32).to_ne_bytes());
    buf.extend_from_slice(&msg_type.to_ne_bytes());
    buf.extend_from_slice(&flags.to_ne_bytes());
    buf.extend_from_slice(&seq.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes());
    buf.extend_from_slice(payload);
    buf.resize(align(len), 0);
    buf
}

/// Split one datagram into its messages.
pub fn decode_messages(mut data: &[u8]) -> Result<Vec<Message>, NetlinkError> {
    let mut messages = Vec::new();
    while data.len() >= NLMSG_HDRLEN {
        let len = read_u32_at(data, 0).ok_or(NetlinkError::Truncated("nlmsghdr"))? as usize;
        if len < NLMSG_HDRLEN || len > data.len() {
            return Err(NetlinkError::BadLength {
                what: "nlmsghdr",
                len,
            });
        }
        let msg_type = read_u16_at(data, 4).ok_or(NetlinkError::Truncated("nlmsghdr"))?;
        let flags = read_u16_at(data, 6).ok_or(NetlinkError::Truncated("nlmsghdr"))?;
        let seq = read_u32_at(data, 8).ok_or(NetlinkError::Truncated("nlmsghdr"))?;
        let pid = read_u32_at(data, 12).ok_or(NetlinkError::Truncated("nlmsghdr"))?;
        let payload = data
            .get(NLMSG_HDRLEN..len)
            .ok_or(NetlinkError::Truncated("payload"))?
            .to_vec();
        messages.push(Message {
            msg_type,
            flags,
            seq,
            pid,
            payload,
        });
        data = data.get(align(len)..).unwrap_or_default();
    }
    Ok(messages)
}

/// Generic netlink header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenlHeader {
    pub cmd: u8,
    pub version: u8,
}

impl GenlHeader {
    pub fn encode(&self) -> [u8; GENL_HDRLEN] {
        [self.cmd, self.version, 0, 0]
    }
}

/// Split a generic netlink payload into its header and attribute bytes.
pub fn split_genl(payload: &[u8]) -> Result<(GenlHeader, &[u8]), NetlinkError> {
    let header = payload
        .get(..GENL_HDRLEN)
        .ok_or(NetlinkError::Truncated("genlmsghdr"))?;
    let (cmd, version) = match header {
        [cmd, version, ..] => (*cmd, *version),
        _ => return Err(NetlinkError::Truncated("genlmsghdr")),
    };
    let rest = payload.get(GENL_HDRLEN..).unwrap_or_default();
    Ok((GenlHeader { cmd, version }, rest))
}

/// A single attribute; `value` excludes header and padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attribute<'a> {
    pub kind: u16,
    pub nested: bool,
    pub value: &'a [u8],
}

impl Attribute<'_> {
    pub fn as_u16(&self) -> Option<u16> {
        read_u16_at(self.value, 0)
    }

    pub fn as_u32(&self) -> Option<u32> {
        read_u32_at(self.value, 0)
    }

    pub fn as_string(&self) -> String {
        c_string(self.value)
    }
}

/// Decode a flat attribute list.
pub fn attributes(mut data: &[u8]) -> Result<Vec<Attribute<'_>>, NetlinkError> {
    let mut attrs = Vec::new();
    while data.len() >= NLA_HDRLEN {
        let len = read_u16_at(data, 0).ok_or(NetlinkError::Truncated("nlattr"))? as usize;
        let raw_kind = read_u16_at(data, 2).ok_or(NetlinkError::Truncated("nlattr"))?;
        if len < NLA_HDRLEN || len > data.len() {
            return Err(NetlinkError::BadLength {
                what: "nlattr",
                len,
            });
        }
        attrs.push(Attribute {
            kind: raw_kind & !(NLA_F_NESTED | NLA_F_NET_BYTEORDER),
            nested: raw_kind & NLA_F_NESTED != 0,
            value: data.get(NLA_HDRLEN..len).unwrap_or_default(),
        });
        data = data.get(align(len)..).unwrap_or_default();
    }
    Ok(attrs)
}

/// Append one attribute, padded to alignment.
pub fn push_attribute(buf: &mut Vec<u8>, kind: u16, value: &[u8]) {
    let len = NLA_HDRLEN + value.len();
    buf.extend_from_slice(&(len as u16).to_ne_bytes());
    buf.extend_from_slice(&kind.to_ne_bytes());
    buf.extend_from_slice(value);
    buf.resize(buf.len() + align(len) - len, 0);
}

/// `CTRL_CMD_GETFAMILY` request for `name`.
pub fn family_request(name: &str, seq: u32) -> Vec<u8> {
    let mut payload = GenlHeader {
        cmd: CTRL_CMD_GETFAMILY,
        version: CTRL_VERSION,
    }
    .encode()
    .to_vec();
    let mut value = name.as_bytes().to_vec();
    value.push(0);
    push_attribute(&mut payload, CTRL_ATTR_FAMILY_NAME, &value);
    encode_message(GENL_ID_CTRL, NLM_F_REQUEST, seq, &payload)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastGroup {
    pub name: String,
    pub id: u32,
}

/// A resolved generic netlink family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Family {
    pub id: u16,
    pub name: String,
    pub groups: Vec<MulticastGroup>,
}

impl Family {
    pub fn group(&self, name: &str) -> Option<u32> {
        self.groups.iter().find(|g| g.name == name).map(|g| g.id)
    }

    /// Parse the controller's `CTRL_CMD_NEWFAMILY` reply payload.
    pub fn decode(payload: &[u8]) -> Result<Self, NetlinkError> {
        let (_, attrs) = split_genl(payload)?;
        let mut id = None;
        let mut name = String::new();
        let mut groups = Vec::new();
        for attr in attributes(attrs)? {
            match attr.kind {
                CTRL_ATTR_FAMILY_ID => id = attr.as_u16(),
                CTRL_ATTR_FAMILY_NAME => name = attr.as_string(),
                CTRL_ATTR_MCAST_GROUPS => {
                    for entry in attributes(attr.value)? {
                        let mut group_name = None;
                        let mut group_id = None;
                        for field in attributes(entry.value)? {
                            match field.kind {
                                CTRL_ATTR_MCAST_GRP_NAME => group_name = Some(field.as_string()),
                                CTRL_ATTR_MCAST_GRP_ID => group_id = field.as_u32(),
                                _ => {}
                            }
                        }
                        if let (Some(name), Some(id)) = (group_name, group_id) {
                            groups.push(MulticastGroup { name, id });
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(Self {
            id: id.ok_or(NetlinkError::MissingAttribute("CTRL_ATTR_FAMILY_ID"))?,
            name,
            groups,
        })
    }
}
