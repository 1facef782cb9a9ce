//! Multi-frame transfer orchestration on top of the protocol engine.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use log::{debug, info};

use crate::{
    link::ByteLink,
    protocol::{Bootloader, EraseDialect},
    Error, ERASED_BYTE, MAX_ERASE_PAGE_COUNT, MAX_READ_BYTES_COUNT, MAX_WRITE_BYTES_COUNT,
};

/// Observer for chunked transfers.
///
/// Receives `(bytes_done, bytes_total)` once per protocol frame, i.e. at
/// most every 256 bytes. Observers render UI or count; they cannot touch
/// engine state.
pub trait Progress {
    fn update(&mut self, done: usize, total: usize);
}

impl<F: FnMut(usize, usize)> Progress for F {
    fn update(&mut self, done: usize, total: usize) {
        self(done, total)
    }
}

/// Observer that discards every event.
pub struct NoProgress;

impl Progress for NoProgress {
    fn update(&mut self, _done: usize, _total: usize) {}
}

fn check_range(address: u32, length: usize) -> Result<(), Error> {
    if address as u64 + length as u64 > u32::MAX as u64 + 1 {
        return Err(Error::InvalidArgument(
            "transfer runs past the end of the address space",
        ));
    }
    Ok(())
}

impl<L: ByteLink> Bootloader<L> {
    /// Install a cancellation flag, checked between frames. A signal
    /// handler may set it from another thread; the running transfer then
    /// stops with [`Error::Cancelled`] at the next chunk boundary, leaving
    /// the device in an intermediate state the caller must erase before
    /// retrying.
    pub fn set_cancel_flag(&mut self, flag: Arc<AtomicBool>) {
        self.cancel = Some(flag);
    }

    fn check_cancelled(&self) -> Result<(), Error> {
        let cancelled = self
            .cancel
            .as_ref()
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false);
        if cancelled {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Read `length` bytes starting at `address`, one Read Memory frame per
    /// 256 bytes. Fails fast: on any sub-chunk error the bytes read so far
    /// are discarded.
    pub fn read_memory_data(
        &mut self,
        address: u32,
        length: usize,
        progress: &mut dyn Progress,
    ) -> Result<Vec<u8>, Error> {
        check_range(address, length)?;
        info!("reading {length} bytes from {address:#010X}");
        let mut data = vec![0u8; length];
        let mut done = 0usize;
        progress.update(0, length);
        for chunk in data.chunks_mut(MAX_READ_BYTES_COUNT) {
            self.check_cancelled()?;
            self.read_memory(address + done as u32, chunk)?;
            done += chunk.len();
            progress.update(done, length);
        }
        Ok(data)
    }

    /// Write `data` starting at `address`, one Write Memory frame per 256
    /// bytes. The address must be word-aligned. A partial trailing word is
    /// right-padded with 0xFF, the erased-flash value, so the padding is
    /// harmless on freshly erased pages.
    pub fn write_memory_data(
        &mut self,
        address: u32,
        data: &[u8],
        progress: &mut dyn Progress,
    ) -> Result<(), Error> {
        if address % 4 != 0 {
            return Err(Error::InvalidArgument("write address must be 4-byte aligned"));
        }
        check_range(address, data.len())?;
        info!("writing {} bytes to {address:#010X}", data.len());
        let total = data.len();
        let mut done = 0usize;
        progress.update(0, total);
        for chunk in data.chunks(MAX_WRITE_BYTES_COUNT) {
            self.check_cancelled()?;
            let chunk_address = address + done as u32;
            if chunk.len() % 4 == 0 {
                self.write_memory(chunk_address, chunk)?;
            } else {
                let mut padded = chunk.to_vec();
                padded.resize((chunk.len() + 3) / 4 * 4, ERASED_BYTE);
                debug!(
                    "padded the trailing {}-byte chunk to {} bytes",
                    chunk.len(),
                    padded.len()
                );
                self.write_memory(chunk_address, &padded)?;
            }
            done += chunk.len();
            progress.update(done, total);
        }
        Ok(())
    }

    /// Erase flash. `None` erases the whole device; otherwise the listed
    /// page indices go through the dialect the device advertised.
    pub fn erase_memory(&mut self, pages: Option<&[u32]>) -> Result<(), Error> {
        let dialect = self.erase_dialect().ok_or(Error::InvalidArgument(
            "device not identified, erase dialect unknown",
        ))?;
        match pages {
            None => match dialect {
                EraseDialect::Legacy => self.erase_all(),
                EraseDialect::Extended => self.extended_erase_all(),
            },
            Some([]) => Err(Error::InvalidArgument("page list is empty")),
            Some(pages) => match dialect {
                EraseDialect::Legacy => {
                    if pages.len() > MAX_ERASE_PAGE_COUNT {
                        return Err(Error::Unsupported(format!(
                            "standard erase takes at most {MAX_ERASE_PAGE_COUNT} pages, got {}",
                            pages.len()
                        )));
                    }
                    let narrow = pages
                        .iter()
                        .map(|page| {
                            u8::try_from(*page).map_err(|_| {
                                Error::Unsupported(format!(
                                    "page {page} does not fit the one-byte index of the standard erase command"
                                ))
                            })
                        })
                        .collect::<Result<Vec<u8>, Error>>()?;
                    self.erase_pages(&narrow)
                }
                EraseDialect::Extended => {
                    let narrow = pages
                        .iter()
                        .map(|page| {
                            u16::try_from(*page).map_err(|_| {
                                Error::Unsupported(format!(
                                    "page {page} does not fit the two-byte index of the extended erase command"
                                ))
                            })
                        })
                        .collect::<Result<Vec<u16>, Error>>()?;
                    self.extended_erase_pages(&narrow)
                }
            },
        }
    }

    /// Read the range back and compare it against `expected`.
    pub fn verify(
        &mut self,
        address: u32,
        expected: &[u8],
        progress: &mut dyn Progress,
    ) -> Result<(), Error> {
        let actual = self.read_memory_data(address, expected.len(), progress)?;
        match expected
            .iter()
            .zip(actual.iter())
            .position(|(expected, actual)| expected != actual)
        {
            None => {
                info!("verified {} bytes at {address:#010X}", expected.len());
                Ok(())
            }
            Some(offset) => Err(Error::Mismatch {
                offset,
                expected: expected[offset],
                actual: actual[offset],
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_payload;
    use crate::testing::{identification_responses, ScriptedLink};
    use crate::ACK;

    fn engine(responses: &[u8]) -> Bootloader<ScriptedLink> {
        Bootloader::new(ScriptedLink::with_responses(responses))
    }

    /// Engine with a populated descriptor advertising the given erase opcode.
    fn identified_engine(erase_opcode: u8) -> Bootloader<ScriptedLink> {
        let mut target = engine(&identification_responses(
            0x31,
            &[0x00, 0x01, 0x02, 0x11, 0x21, 0x31, erase_opcode],
            0x413,
        ));
        target.identify(None).unwrap();
        target.link.written.clear();
        target
    }

    /// Responses for one Read Memory frame answering with `data`.
    fn read_frame_responses(data: &[u8]) -> Vec<u8> {
        let mut responses = vec![ACK, ACK, ACK];
        responses.extend_from_slice(data);
        responses
    }

    #[test]
    fn reads_split_into_frames_covering_the_range_exactly_once() {
        let mut responses = Vec::new();
        for chunk_len in [256usize, 256, 188] {
            responses.extend(read_frame_responses(&vec![0xA5; chunk_len]));
        }
        let mut target = engine(&responses);

        let mut events = Vec::new();
        let data = target
            .read_memory_data(0x0800_0000, 700, &mut |done: usize, total: usize| {
                events.push((done, total))
            })
            .unwrap();

        assert_eq!(700, data.len());
        assert!(data.iter().all(|b| *b == 0xA5));
        assert_eq!(
            vec![(0, 700), (256, 700), (512, 700), (700, 700)],
            events
        );

        // three frames, each targeting the previous end address
        let written = &target.link.written;
        let mut frames = Vec::new();
        let mut offset = 0;
        while offset < written.len() {
            // command (2) + address (5) + length (2)
            let address = u32::from_be_bytes(written[offset + 2..offset + 6].try_into().unwrap());
            let length = usize::from(written[offset + 7]) + 1;
            frames.push((address, length));
            offset += 9;
        }
        assert_eq!(
            vec![(0x0800_0000, 256), (0x0800_0100, 256), (0x0800_0200, 188)],
            frames
        );
    }

    #[test]
    fn zero_length_read_touches_nothing() {
        let mut target = engine(&[]);
        let mut events = Vec::new();
        let data = target
            .read_memory_data(0x0800_0000, 0, &mut |done: usize, total: usize| {
                events.push((done, total))
            })
            .unwrap();
        assert!(data.is_empty());
        assert_eq!(vec![(0, 0)], events);
        assert!(target.link.written.is_empty());
    }

    #[test]
    fn writes_split_into_frames_and_report_progress() {
        // three frames, three ACKs each
        let mut target = engine(&[ACK; 9]);
        let data: Vec<u8> = (0..600u32).map(|i| i as u8).collect();

        let mut events = Vec::new();
        target
            .write_memory_data(0x0800_0000, &data, &mut |done: usize, total: usize| {
                events.push((done, total))
            })
            .unwrap();
        assert_eq!(
            vec![(0, 600), (256, 600), (512, 600), (600, 600)],
            events
        );

        // second frame carries the second 256-byte slice at +0x100; a full
        // frame is command (2) + address (5) + length, data, checksum (258)
        let expected_second_address = encode_payload(&0x0800_0100u32.to_be_bytes());
        let second_frame = &target.link.written[2 + 5 + 258..];
        assert_eq!(expected_second_address[..], second_frame[2..7]);
    }

    #[test]
    fn short_tail_writes_are_padded_with_erased_bytes() {
        let mut target = engine(&[ACK, ACK, ACK]);
        target
            .write_memory_data(0x0800_0000, &[0xAA, 0xBB, 0xCC], &mut NoProgress)
            .unwrap();
        assert_eq!(
            vec![
                0x31, 0xCE, // command
                0x08, 0x00, 0x00, 0x00, 0x08, // address
                0x03, 0xAA, 0xBB, 0xCC, 0xFF, 0x21, // padded to a full word
            ],
            target.link.written
        );
    }

    #[test]
    fn unaligned_write_addresses_are_rejected() {
        let mut target = engine(&[]);
        assert!(matches!(
            target.write_memory_data(0x0800_0002, &[0; 8], &mut NoProgress),
            Err(Error::InvalidArgument(_))
        ));
        assert!(target.link.written.is_empty());
    }

    #[test]
    fn transfers_past_the_address_space_are_rejected() {
        let mut target = engine(&[]);
        assert!(matches!(
            target.read_memory_data(0xFFFF_FF00, 0x200, &mut NoProgress),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn erase_memory_requires_identification() {
        let mut target = engine(&[]);
        assert!(matches!(
            target.erase_memory(None),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn mass_erase_routes_through_the_advertised_dialect() {
        let mut target = identified_engine(0x44);
        target.link.push_responses(&[ACK, ACK]);
        target.erase_memory(None).unwrap();
        assert_eq!(vec![0x44, 0xBB, 0xFF, 0xFF, 0x00], target.link.written);

        let mut target = identified_engine(0x43);
        target.link.push_responses(&[ACK, ACK]);
        target.erase_memory(None).unwrap();
        assert_eq!(vec![0x43, 0xBC, 0xFF, 0x00], target.link.written);
    }

    #[test]
    fn page_erase_narrows_indices_per_dialect() {
        let mut target = identified_engine(0x43);
        target.link.push_responses(&[ACK, ACK]);
        target.erase_memory(Some(&[0, 2, 5])).unwrap();
        assert_eq!(
            vec![0x43, 0xBC, 0x02, 0x00, 0x02, 0x05, 0x05],
            target.link.written
        );

        let mut target = identified_engine(0x44);
        target.link.push_responses(&[ACK, ACK]);
        target.erase_memory(Some(&[0x100])).unwrap();
        assert_eq!(
            vec![0x44, 0xBB, 0x00, 0x00, 0x01, 0x00, 0x01],
            target.link.written
        );
    }

    #[test]
    fn empty_page_lists_are_an_error() {
        let mut target = identified_engine(0x44);
        assert!(matches!(
            target.erase_memory(Some(&[])),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn pages_beyond_the_dialect_limits_are_unsupported() {
        let mut target = identified_engine(0x43);
        assert!(matches!(
            target.erase_memory(Some(&[256])),
            Err(Error::Unsupported(_))
        ));
        let many: Vec<u32> = (0..256).collect();
        assert!(matches!(
            target.erase_memory(Some(&many)),
            Err(Error::Unsupported(_))
        ));

        let mut target = identified_engine(0x44);
        assert!(matches!(
            target.erase_memory(Some(&[0x1_0000])),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn verify_accepts_identical_readback() {
        let expected = [0x01, 0x02, 0x03, 0x04];
        let mut target = engine(&read_frame_responses(&expected));
        target.verify(0x0800_0000, &expected, &mut NoProgress).unwrap();
    }

    #[test]
    fn verify_reports_the_first_difference() {
        let mut target = engine(&read_frame_responses(&[0x01, 0x02, 0xFF, 0x04]));
        let err = target
            .verify(0x0800_0000, &[0x01, 0x02, 0x03, 0x04], &mut NoProgress)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Mismatch {
                offset: 2,
                expected: 0x03,
                actual: 0xFF,
            }
        ));
    }

    #[test]
    fn cancellation_stops_between_frames() {
        let flag = Arc::new(AtomicBool::new(true));
        let mut target = engine(&[]);
        target.set_cancel_flag(flag);
        let err = target
            .read_memory_data(0x0800_0000, 16, &mut NoProgress)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(target.link.written.is_empty());
    }
}
