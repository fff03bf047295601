#![cfg_attr(not(target_os = "none"), allow(dead_code))]

//! Outbound queues between the engine and the UART and FDCAN tasks.
//!
//! The engine transmits from the tick context and must never wait, so
//! [`LinkSink`] only ever `try_`s and counts what it had to drop.

use ecu_core::io::{TelemetryChannel, TelemetrySink};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::pipe::Pipe;
use heapless::Vec;

/// Bytes buffered for the host UART.
pub const HOST_PIPE_LEN: usize = 512;

/// Bus frames buffered for the FDCAN task.
pub const BUS_QUEUE_DEPTH: usize = 16;

/// Classic CAN payload limit.
pub const BUS_FRAME_LEN: usize = 8;

pub type HostPipe = Pipe<CriticalSectionRawMutex, HOST_PIPE_LEN>;
pub type BusQueue = Channel<CriticalSectionRawMutex, BusFrame, BUS_QUEUE_DEPTH>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusFrame {
    pub id: u16,
    pub data: Vec<u8, BUS_FRAME_LEN>,
}

/// [`TelemetrySink`] feeding the link tasks.
pub struct LinkSink<'a> {
    host: &'a HostPipe,
    bus: &'a BusQueue,
    dropped: u32,
}

impl<'a> LinkSink<'a> {
    pub const fn new(host: &'a HostPipe, bus: &'a BusQueue) -> Self {
        Self {
            host,
            bus,
            dropped: 0,
        }
    }

    /// Messages lost to full queues or oversized payloads.
    pub const fn dropped(&self) -> u32 {
        self.dropped
    }

    fn note_drop(&mut self) {
        self.dropped = self.dropped.wrapping_add(1);
    }
}

impl TelemetrySink for LinkSink<'_> {
    fn transmit(&mut self, channel: TelemetryChannel, bytes: &[u8]) {
        match channel {
            TelemetryChannel::Host => {
                if self.host.try_write(bytes).ok() != Some(bytes.len()) {
                    self.note_drop();
                }
            }
            TelemetryChannel::Bus(id) => {
                let Ok(data) = Vec::from_slice(bytes) else {
                    self.note_drop();
                    return;
                };
                if self.bus.try_send(BusFrame { id, data }).is_err() {
                    self.note_drop();
                }
            }
        }
    }
}
