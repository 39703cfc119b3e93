// Copyright 2017-2019 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! hermes is a protocol bridge between a board-game UI and external
//! chess/variant engines. A process host spawns engine binaries and relays
//! their stdio over a framed transport; client-side sessions drive the
//! UCI/USI/UCCI handshake, option negotiation, and search control, and the
//! notation module translates moves and FENs between the wire dialects for
//! boards of arbitrary width and height.

#[macro_use]
extern crate num_derive;
#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;

mod config;
pub mod host;
pub mod notation;
pub mod registry;
pub mod session;
pub mod transport;
mod types;

pub use config::HostConfig;
pub use host::ProcessHost;
pub use registry::{EngineDescriptor, EngineOption, EngineRegistry, OptionKind, RegistryError};
pub use session::{
    BoardQuery, EngineSession, SessionEvent, SessionManager, SessionState, ThinkMode, ThinkParams,
};
pub use transport::{DecodeError, Message};
pub use types::{Dialect, EngineCapabilities, EngineKey, SlotColor};
