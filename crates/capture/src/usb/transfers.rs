//! Control transfer execution
//!
//! libusb control transfers are synchronous. They are run when the request is
//! issued and the result is kept as a [`TransferCompletion`] for the next
//! completion poll.

use protocol::{Direction, SetupPacket, TransferCompletion, UsbError};
use rusb::{Context, DeviceHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Timeout for control transfers
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

/// Run a class or standard control request on endpoint 0
///
/// `rusb::Error::Busy` is returned as-is so the caller can report a failed
/// issuance; every other failure becomes a failed completion.
pub fn execute_control(
    handle: &DeviceHandle<Context>,
    setup: &SetupPacket,
    data: &[u8],
) -> Result<TransferCompletion, rusb::Error> {
    debug!(
        "Control transfer: request_type={:#04x}, request={:#04x}, value={:#06x}, index={:#06x}, length={}",
        setup.request_type, setup.request, setup.value, setup.index, setup.length
    );

    let result = match setup.direction() {
        Direction::In => {
            let mut buffer = vec![0u8; usize::from(setup.length)];
            handle
                .read_control(
                    setup.request_type,
                    setup.request,
                    setup.value,
                    setup.index,
                    &mut buffer,
                    CONTROL_TIMEOUT,
                )
                .map(|len| {
                    buffer.truncate(len);
                    TransferCompletion::with_data(buffer)
                })
        }
        Direction::Out => handle
            .write_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                data,
                CONTROL_TIMEOUT,
            )
            .map(TransferCompletion::sent),
    };

    match result {
        Ok(completion) => Ok(completion),
        Err(rusb::Error::Busy) => Err(rusb::Error::Busy),
        Err(e) => {
            warn!("Control transfer failed: {}", e);
            Ok(TransferCompletion::failed(map_rusb_error(e)))
        }
    }
}

/// Map rusb::Error to protocol::UsbError
pub fn map_rusb_error(err: rusb::Error) -> UsbError {
    match err {
        rusb::Error::Timeout => UsbError::Timeout,
        rusb::Error::Pipe => UsbError::Pipe,
        rusb::Error::NoDevice => UsbError::NoDevice,
        rusb::Error::NotFound => UsbError::NotFound,
        rusb::Error::Busy => UsbError::Busy,
        rusb::Error::Overflow => UsbError::Overflow,
        rusb::Error::Io => UsbError::Io,
        rusb::Error::InvalidParam => UsbError::InvalidParam,
        rusb::Error::Access => UsbError::Access,
        _ => UsbError::Other {
            message: err.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::Timeout), UsbError::Timeout);
        assert_eq!(map_rusb_error(rusb::Error::Pipe), UsbError::Pipe);
        assert_eq!(map_rusb_error(rusb::Error::NoDevice), UsbError::NoDevice);
        assert_eq!(map_rusb_error(rusb::Error::Busy), UsbError::Busy);
        assert!(matches!(
            map_rusb_error(rusb::Error::NotSupported),
            UsbError::Other { .. }
        ));
    }
}
