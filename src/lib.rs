//! Caps the power an EV charger may draw or feed back so the household stays within its fuse
//! limit.
//!
//! The crate sits as a Modbus TCP proxy between the existing charging controller and the
//! charger. Setpoint writes are clamped on the fly by the [`RequestInterceptor`], while the
//! [`RateController`] moves the ceiling up and down from household power samples.

pub mod balancer;
pub mod codec;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod interceptor;
pub mod mqtt;
pub mod proxy;
pub mod registers;
pub mod scheduler;
pub mod upstream;

pub use balancer::{BalancerHandle, LoadBalancer, Status};
pub use codec::{decode_signed_power, encode_signed_power};
pub use config::Config;
pub use controller::{ControllerSettings, Phase, RateController};
pub use error::{Error, Result};
pub use events::{Events, Topic};
pub use interceptor::{RateLimiter, RequestInterceptor, SetpointWriter};
pub use proxy::{PduHook, ProxyServer};
pub use registers::RegisterAddress;
pub use upstream::Upstream;
