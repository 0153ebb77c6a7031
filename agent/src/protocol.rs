use std::time::Duration;

use growbot_common::{DeviceError, DeviceResult};

use crate::bus::BusTransport;

/// Register the ASCII command bytes are written to, and the register the
/// status-prefixed response is read back from.
pub const COMMAND_REGISTER: u8 = 0x00;

/// Longest response any supported module produces, status byte included.
pub const RESPONSE_LENGTH: usize = 52;

pub const STATUS_SUCCESS: u8 = 0x01;
pub const STATUS_ERROR: u8 = 0x02;
pub const STATUS_BUSY: u8 = 0xFE;
pub const STATUS_NO_DATA: u8 = 0xFF;

/// Busy-retry bound. The reference behavior retried forever; a wedged device
/// would stall its worker (and shutdown) indefinitely, so the retry loop is
/// capped and expiry surfaces as a timing error.
const BUSY_RETRY_LIMIT: u32 = 40;
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Command/response codec for one probe module. Owns the device's transport;
/// exclusive ownership is what makes the bus access single-threaded.
pub struct Codec {
    bus: Box<dyn BusTransport>,
    address: u16,
}

impl Codec {
    pub fn new(bus: Box<dyn BusTransport>, address: u16) -> Self {
        Self { bus, address }
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    /// Used after a bus-address change command: the device reboots onto the
    /// new address and all further traffic goes there.
    pub fn set_address(&mut self, address: u16) {
        self.address = address;
    }

    pub async fn probe(&mut self) -> DeviceResult<bool> {
        self.bus.probe(self.address).await
    }

    /// Writes the command's ASCII bytes as a block write at the command
    /// register.
    pub async fn send(&mut self, command: &str) -> DeviceResult<()> {
        self.bus
            .write(self.address, COMMAND_REGISTER, command.as_bytes())
            .await
    }

    /// Reads back a status-prefixed response. `Ok(None)` means the device had
    /// nothing to report, which callers treat as success without payload.
    pub async fn receive(&mut self) -> DeviceResult<Option<String>> {
        for _ in 0..BUSY_RETRY_LIMIT {
            let frame = self
                .bus
                .read(self.address, COMMAND_REGISTER, RESPONSE_LENGTH)
                .await?;

            match frame.first().copied() {
                Some(STATUS_SUCCESS) => return decode_payload(&frame[1..]).map(Some),
                Some(STATUS_ERROR) => {
                    return Err(DeviceError::Protocol(
                        "device rejected the command as malformed".into(),
                    ))
                }
                Some(STATUS_BUSY) => tokio::time::sleep(BUSY_RETRY_DELAY).await,
                Some(STATUS_NO_DATA) => return Ok(None),
                Some(other) => {
                    return Err(DeviceError::Protocol(format!(
                        "unknown response status {other:#04x}"
                    )))
                }
                None => return Err(DeviceError::Protocol("empty response frame".into())),
            }
        }

        Err(DeviceError::Timing(format!(
            "device still busy after {BUSY_RETRY_LIMIT} status reads"
        )))
    }

    /// Full exchange: send, wait out the device moment, read the response.
    pub async fn transact(
        &mut self,
        command: &str,
        moment: Duration,
    ) -> DeviceResult<Option<String>> {
        self.send(command).await?;
        tokio::time::sleep(moment).await;
        self.receive().await
    }
}

fn decode_payload(raw: &[u8]) -> DeviceResult<String> {
    let terminated: &[u8] = match raw.iter().position(|byte| *byte == 0) {
        Some(end) => &raw[..end],
        None => raw,
    };

    let payload = std::str::from_utf8(terminated)
        .map_err(|_| DeviceError::Protocol("non-ASCII response payload".into()))?;
    Ok(payload.to_string())
}

/// Validates that a query response echoes the expected `?<NAME>` tag and
/// returns the fields after it.
pub fn expect_tag(response: &str, tag: &str) -> DeviceResult<Vec<String>> {
    let mut fields = response.split(',');
    let echoed = fields.next().unwrap_or("");
    let expected = format!("?{tag}");

    if !echoed.eq_ignore_ascii_case(&expected) {
        return Err(DeviceError::Protocol(format!(
            "expected a {expected} response, device answered '{response}'"
        )));
    }

    Ok(fields.map(str::to_string).collect())
}
