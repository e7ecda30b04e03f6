//! scangate gateway daemon
//!
//! Turns an intermittently-connected USB barcode scanner into a
//! POS-synchronized input device while keeping USB power off outside active
//! scan sessions. The library exposes the hardware-session subsystem; the
//! `scangate` binary wires it together and runs it as a service.

pub mod config;
pub mod pos;
pub mod scanner;
pub mod service;
pub mod usb;
