//! Scripted [`ByteLink`] fake for wire-level tests.

use std::collections::VecDeque;

use crate::{link::ByteLink, Error, ACK};

/// Pin and buffer activity recorded by [`ScriptedLink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinEvent {
    Reset(bool),
    Boot0(bool),
    FlushInput,
}

/// Plays the part of the target: answers reads from a canned byte queue and
/// records every byte and pin transition the engine produces.
pub struct ScriptedLink {
    /// Bytes the fake target will answer with, in order
    pub responses: VecDeque<u8>,
    /// Every byte the engine wrote, in order
    pub written: Vec<u8>,
    /// Pin transitions and input flushes, in order
    pub pins: Vec<PinEvent>,
    /// Number of reads that time out before the queue starts answering
    pub swallow_reads: usize,
}

impl ScriptedLink {
    pub fn with_responses(responses: &[u8]) -> Self {
        Self {
            responses: responses.iter().copied().collect(),
            written: Vec::new(),
            pins: Vec::new(),
            swallow_reads: 0,
        }
    }

    pub fn push_responses(&mut self, more: &[u8]) {
        self.responses.extend(more.iter().copied());
    }
}

impl ByteLink for ScriptedLink {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        if self.swallow_reads > 0 {
            self.swallow_reads -= 1;
            return Err(Error::Timeout);
        }
        for slot in buf.iter_mut() {
            *slot = self.responses.pop_front().ok_or(Error::Timeout)?;
        }
        Ok(())
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.written.extend_from_slice(bytes);
        Ok(())
    }

    fn flush_input(&mut self) -> Result<(), Error> {
        self.pins.push(PinEvent::FlushInput);
        Ok(())
    }

    fn set_reset(&mut self, active: bool) -> Result<(), Error> {
        self.pins.push(PinEvent::Reset(active));
        Ok(())
    }

    fn set_boot0(&mut self, active: bool) -> Result<(), Error> {
        self.pins.push(PinEvent::Boot0(active));
        Ok(())
    }
}

/// Canned responses for the full Get / Get Version / Get ID identification
/// sequence. `opcodes` is what the fake bootloader advertises; the Get
/// Version exchange is scripted only when 0x01 is among them.
pub fn identification_responses(version: u8, opcodes: &[u8], product_id: u16) -> Vec<u8> {
    let mut responses = vec![ACK, opcodes.len() as u8, version];
    responses.extend_from_slice(opcodes);
    responses.push(ACK);
    if opcodes.contains(&0x01) {
        responses.extend_from_slice(&[ACK, version, 0x00, 0x00, ACK]);
    }
    responses.extend_from_slice(&[
        ACK,
        0x01,
        (product_id >> 8) as u8,
        (product_id & 0xFF) as u8,
        ACK,
    ]);
    responses
}
