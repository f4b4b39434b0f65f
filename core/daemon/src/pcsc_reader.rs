//! PC/SC contactless reader (feature `pcsc`).
//!
//! Waits for a newly presented card, asks for its UID with the PC/SC
//! pseudo-APDU GET DATA and hex-encodes the answer. A card that is already on
//! the reader when it is first polled is not reported.

use crate::error::ReaderError;
use crate::tag::TagId;

/// PC/SC GET DATA (UID / IDm).
#[cfg_attr(not(feature = "pcsc"), allow(dead_code))]
pub const GET_UID_APDU: [u8; 5] = [0xFF, 0xCA, 0x00, 0x00, 0x00];

const SW_SUCCESS: [u8; 2] = [0x90, 0x00];

/// Splits a GET DATA response into UID and status word and validates both.
#[cfg_attr(not(feature = "pcsc"), allow(dead_code))]
pub fn parse_uid_response(response: &[u8]) -> Result<TagId, ReaderError> {
    if response.len() < SW_SUCCESS.len() {
        return Err(ReaderError::Protocol(format!(
            "short GET DATA response ({} bytes)",
            response.len()
        )));
    }
    let (data, status) = response.split_at(response.len() - SW_SUCCESS.len());
    if status != SW_SUCCESS {
        return Err(ReaderError::Protocol(format!(
            "GET DATA failed with status {:02X}{:02X}",
            status[0], status[1]
        )));
    }
    TagId::from_uid_bytes(data)
        .ok_or_else(|| ReaderError::Protocol("GET DATA returned an empty UID".to_string()))
}

#[cfg(feature = "pcsc")]
pub use device::PcscReader;

#[cfg(feature = "pcsc")]
mod device {
    use pcsc::{Context, Protocols, ReaderState, Scope, ShareMode, State, MAX_BUFFER_SIZE};
    use std::ffi::CString;
    use std::time::Duration;
    use tracing::{debug, info};

    use super::{parse_uid_response, GET_UID_APDU};
    use crate::error::ReaderError;
    use crate::reader::{TagRead, TagReader};

    pub struct PcscReader {
        context: Context,
        name_filter: Option<String>,
        reader: Option<CString>,
        last_state: Option<State>,
    }

    impl PcscReader {
        pub fn new(name_filter: Option<String>) -> Result<Self, ReaderError> {
            let context = Context::establish(Scope::User).map_err(|err| {
                ReaderError::Unavailable(format!("failed to establish PC/SC context: {}", err))
            })?;
            Ok(Self {
                context,
                name_filter,
                reader: None,
                last_state: None,
            })
        }

        fn select_reader(&mut self) -> Result<CString, ReaderError> {
            if let Some(reader) = &self.reader {
                return Ok(reader.clone());
            }

            let readers = self.context.list_readers_owned().map_err(|err| {
                ReaderError::Unavailable(format!("failed to list PC/SC readers: {}", err))
            })?;
            let selected = readers
                .into_iter()
                .find(|name| match &self.name_filter {
                    Some(filter) => name.to_string_lossy().contains(filter.as_str()),
                    None => true,
                })
                .ok_or_else(|| ReaderError::Unavailable("no matching PC/SC reader".to_string()))?;

            info!(reader = %selected.to_string_lossy(), "Using PC/SC reader");
            self.reader = Some(selected.clone());
            self.last_state = None;
            Ok(selected)
        }

        fn forget_reader(&mut self) {
            self.reader = None;
            self.last_state = None;
        }

        /// Waits for a state change. Returns the new state, or `None` on timeout.
        fn wait_for_change(
            &mut self,
            reader: &CString,
            timeout: Duration,
        ) -> Result<Option<State>, ReaderError> {
            let known = self.last_state.unwrap_or(State::UNAWARE);
            let mut states = [ReaderState::new(reader.clone(), known)];
            match self.context.get_status_change(timeout, &mut states) {
                Ok(()) => {
                    let mut event = states[0].event_state();
                    event.remove(State::CHANGED);
                    self.last_state = Some(event);
                    Ok(Some(event))
                }
                Err(pcsc::Error::Timeout) => Ok(None),
                Err(err) => {
                    self.forget_reader();
                    Err(ReaderError::Unavailable(format!(
                        "PC/SC status change failed: {}",
                        err
                    )))
                }
            }
        }

        fn read_uid(&self, reader: &CString) -> Result<TagRead, ReaderError> {
            let card = match self
                .context
                .connect(reader, ShareMode::Shared, Protocols::ANY)
            {
                Ok(card) => card,
                // The card left before we could talk to it.
                Err(pcsc::Error::NoSmartcard) | Err(pcsc::Error::RemovedCard) => {
                    return Ok(TagRead::Timeout)
                }
                Err(err) => {
                    return Err(ReaderError::Protocol(format!(
                        "failed to connect to card: {}",
                        err
                    )))
                }
            };

            let mut buffer = [0u8; MAX_BUFFER_SIZE];
            let response = card
                .transmit(&GET_UID_APDU, &mut buffer)
                .map_err(|err| ReaderError::Protocol(format!("GET DATA failed: {}", err)))?;
            parse_uid_response(response).map(TagRead::Tag)
        }
    }

    impl TagReader for PcscReader {
        fn read(&mut self, timeout: Duration) -> Result<TagRead, ReaderError> {
            let reader = self.select_reader()?;

            if self.last_state.is_none() {
                // Learn the current state first so a card left on the reader
                // is not reported as a new tap.
                self.wait_for_change(&reader, Duration::ZERO)?;
            }

            let was_present = self
                .last_state
                .map(|state| state.contains(State::PRESENT))
                .unwrap_or(false);
            let Some(state) = self.wait_for_change(&reader, timeout)? else {
                return Ok(TagRead::Timeout);
            };

            if !state.contains(State::PRESENT) || was_present {
                debug!(state = ?state, "Reader state changed without a new card");
                return Ok(TagRead::Timeout);
            }

            self.read_uid(&reader)
        }

        fn kind(&self) -> &'static str {
            "pcsc"
        }
    }
}
