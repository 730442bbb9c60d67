//! Video-class control requests
//!
//! Request codes, control selectors and the setup packet used to drive the
//! PROBE/COMMIT negotiation on the video streaming interface. Callers pick a
//! [`RequestCode`]; the transfer direction and request-type bits are derived
//! from it, never passed in separately.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::fmt;

/// bmRequestType direction bit: device-to-host
pub const USB_DEVICE_TO_HOST: u8 = 0x80;
/// bmRequestType direction bit: host-to-device
pub const USB_HOST_TO_DEVICE: u8 = 0x00;
/// bmRequestType type field: standard request
pub const USB_REQUEST_TYPE_STANDARD: u8 = 0x00;
/// bmRequestType type field: class-specific request
pub const USB_REQUEST_TYPE_CLASS: u8 = 0x20;
/// bmRequestType recipient field: interface
pub const USB_RECIPIENT_INTERFACE: u8 = 0x01;

/// Standard SET_INTERFACE bRequest
pub const USB_REQUEST_SET_INTERFACE: u8 = 0x0B;

/// Transfer direction, from the host's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Device to host (GET requests, isochronous IN)
    In,
    /// Host to device (SET requests)
    Out,
}

/// Video-class request codes (bRequest)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RequestCode {
    SetCur = 0x01,
    GetCur = 0x81,
    GetMin = 0x82,
    GetMax = 0x83,
    GetRes = 0x84,
    GetLen = 0x85,
    GetInfo = 0x86,
    GetDef = 0x87,
}

impl RequestCode {
    /// Raw bRequest value
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Parse a raw bRequest value
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::SetCur),
            0x81 => Some(Self::GetCur),
            0x82 => Some(Self::GetMin),
            0x83 => Some(Self::GetMax),
            0x84 => Some(Self::GetRes),
            0x85 => Some(Self::GetLen),
            0x86 => Some(Self::GetInfo),
            0x87 => Some(Self::GetDef),
            _ => None,
        }
    }

    /// SET_CUR is the only request that carries data to the device
    pub fn is_set(self) -> bool {
        self == Self::SetCur
    }

    /// Direction implied by the request code
    pub fn direction(self) -> Direction {
        if self.is_set() {
            Direction::Out
        } else {
            Direction::In
        }
    }

    /// Full bmRequestType for a class request addressed to an interface
    pub fn request_type(self) -> u8 {
        let direction = match self.direction() {
            Direction::In => USB_DEVICE_TO_HOST,
            Direction::Out => USB_HOST_TO_DEVICE,
        };
        direction | USB_REQUEST_TYPE_CLASS | USB_RECIPIENT_INTERFACE
    }

    fn name(self) -> &'static str {
        match self {
            Self::SetCur => "SET_CUR",
            Self::GetCur => "GET_CUR",
            Self::GetMin => "GET_MIN",
            Self::GetMax => "GET_MAX",
            Self::GetRes => "GET_RES",
            Self::GetLen => "GET_LEN",
            Self::GetInfo => "GET_INFO",
            Self::GetDef => "GET_DEF",
        }
    }
}

impl fmt::Display for RequestCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Video streaming interface control selectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ControlSelector {
    /// VS_PROBE_CONTROL: propose parameters without committing resources
    Probe = 0x01,
    /// VS_COMMIT_CONTROL: commit the probed parameters
    Commit = 0x02,
}

impl ControlSelector {
    /// Raw selector value (high byte of wValue)
    pub fn value(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ControlSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Probe => f.write_str("VS_PROBE_CONTROL"),
            Self::Commit => f.write_str("VS_COMMIT_CONTROL"),
        }
    }
}

/// Control transfer setup stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SetupPacket {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength
    pub length: u16,
}

impl SetupPacket {
    /// Class-specific request on the streaming interface
    ///
    /// The selector goes in the high byte of wValue, `index` is the interface
    /// (or entity) number.
    pub fn class_interface(
        request: RequestCode,
        selector: ControlSelector,
        index: u16,
        length: u16,
    ) -> Self {
        Self {
            request_type: request.request_type(),
            request: request.code(),
            value: u16::from(selector.value()) << 8,
            index,
            length,
        }
    }

    /// Standard SET_INTERFACE selecting an alternate setting
    pub fn set_interface(interface: u16, alternate_setting: u16) -> Self {
        Self {
            request_type: USB_HOST_TO_DEVICE | USB_REQUEST_TYPE_STANDARD | USB_RECIPIENT_INTERFACE,
            request: USB_REQUEST_SET_INTERFACE,
            value: alternate_setting,
            index: interface,
            length: 0,
        }
    }

    /// Direction encoded in bit 7 of bmRequestType
    pub fn direction(&self) -> Direction {
        if self.request_type & USB_DEVICE_TO_HOST != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// True for the standard SET_INTERFACE request
    pub fn is_set_interface(&self) -> bool {
        self.request == USB_REQUEST_SET_INTERFACE
            && self.request_type & 0x60 == USB_REQUEST_TYPE_STANDARD
    }

    /// Class request code, if this is a video-class request
    pub fn request_code(&self) -> Option<RequestCode> {
        if self.request_type & 0x60 != USB_REQUEST_TYPE_CLASS {
            return None;
        }
        RequestCode::from_code(self.request)
    }

    /// Control selector from the high byte of wValue
    pub fn selector(&self) -> Option<ControlSelector> {
        match (self.value >> 8) as u8 {
            0x01 => Some(ControlSelector::Probe),
            0x02 => Some(ControlSelector::Commit),
            _ => None,
        }
    }

    /// Wire encoding (little-endian fields)
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0] = self.request_type;
        out[1] = self.request;
        LittleEndian::write_u16(&mut out[2..4], self.value);
        LittleEndian::write_u16(&mut out[4..6], self.index);
        LittleEndian::write_u16(&mut out[6..8], self.length);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_requests_are_device_to_host() {
        for code in [
            RequestCode::GetCur,
            RequestCode::GetMin,
            RequestCode::GetMax,
            RequestCode::GetInfo,
            RequestCode::GetDef,
        ] {
            assert_eq!(code.direction(), Direction::In);
            assert_eq!(code.request_type(), 0xA1);
        }
    }

    #[test]
    fn test_set_cur_is_host_to_device() {
        assert!(RequestCode::SetCur.is_set());
        assert_eq!(RequestCode::SetCur.direction(), Direction::Out);
        assert_eq!(RequestCode::SetCur.request_type(), 0x21);
    }

    #[test]
    fn test_class_interface_setup() {
        let setup =
            SetupPacket::class_interface(RequestCode::GetCur, ControlSelector::Commit, 1, 26);
        assert_eq!(setup.to_bytes(), [0xA1, 0x81, 0x00, 0x02, 0x01, 0x00, 26, 0x00]);
        assert_eq!(setup.direction(), Direction::In);
        assert_eq!(setup.request_code(), Some(RequestCode::GetCur));
        assert_eq!(setup.selector(), Some(ControlSelector::Commit));
        assert!(!setup.is_set_interface());
    }

    #[test]
    fn test_set_interface_setup() {
        let setup = SetupPacket::set_interface(1, 6);
        assert_eq!(setup.to_bytes(), [0x01, 0x0B, 0x06, 0x00, 0x01, 0x00, 0x00, 0x00]);
        assert!(setup.is_set_interface());
        assert_eq!(setup.direction(), Direction::Out);
        assert_eq!(setup.request_code(), None);
    }

    #[test]
    fn test_request_code_from_code() {
        assert_eq!(RequestCode::from_code(0x86), Some(RequestCode::GetInfo));
        assert_eq!(RequestCode::from_code(0x00), None);
        assert_eq!(RequestCode::GetDef.to_string(), "GET_DEF");
        assert_eq!(ControlSelector::Probe.to_string(), "VS_PROBE_CONTROL");
    }
}
