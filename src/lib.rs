#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![deny(missing_debug_implementations, nonstandard_style)]
#![warn(unreachable_pub)]

#[macro_use]
extern crate serde_derive;

extern crate serde;
extern crate serde_json;
extern crate url;

pub mod api;
pub mod builder;
pub mod driver;
pub mod engine;
pub mod lifecycle;
pub mod logging;
pub mod platform;
pub mod process;
pub mod settings;
pub mod status;
pub mod vmrest;
pub mod vmx;
