#![no_std]

// Real-time control core shared by the ECU firmware and the host emulator.
//
// Everything here stays portable across the MCU and host builds: no standard
// library, no allocation, and hardware reached only through the traits in
// `io` and `storage`.

pub mod afr;
pub mod config;
pub mod console;
pub mod engine;
pub mod fuel;
pub mod idle;
pub mod io;
pub mod scheduler;
pub mod sensors;
pub mod sequencer;
pub mod status;
pub mod storage;
pub mod table;
pub mod telemetry;
pub mod trigger;
pub mod vvt;
