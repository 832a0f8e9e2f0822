use tokio_modbus::prelude::{Request, Response};
use tracing::{debug, info, warn};

use crate::codec::{decode_signed_power, encode_signed_power};
use crate::events::Events;
use crate::registers::{ChargeAction, RegisterAddress};

/// Capability to adjust the enforced charge power ceiling.
pub trait RateLimiter {
    /// Sets the ceiling magnitude in Watts.
    fn set_limit(&mut self, limit: u32);

    fn current_limit(&self) -> u32;
}

/// Writes a power setpoint to the charger out of band.
/// Implementations must not block: the outcome is only logged.
///
/// Ordering against controller writes already in flight is not guaranteed. An older, higher
/// clamped value may reach the charger after the push; the controller's next write is clamped
/// to the new limit again.
pub trait SetpointWriter {
    fn write_setpoint(&self, raw: u16);
}

/// Caps the magnitude of `value` to `limit`, keeping its sign.
pub fn clamp_setpoint(value: i16, limit: u32) -> i16 {
    let limit = i32::try_from(limit).unwrap_or(i32::MAX);
    // |result| <= |value|, so it always fits back into i16
    i32::from(value).clamp(-limit, limit) as i16
}

/// Watches the controller's writes and rewrites power setpoints so the charger never gets
/// more than the current limit.
#[derive(Debug)]
pub struct RequestInterceptor<W> {
    writer: W,
    events: Events,
    limit: u32,
    requested_setpoint: i16,
    charge_intent: bool,
    charger_power: Option<i16>,
}

impl<W: SetpointWriter> RequestInterceptor<W> {
    pub fn new(writer: W, events: Events) -> Self {
        Self {
            writer,
            events,
            limit: 0,
            requested_setpoint: 0,
            charge_intent: false,
            charger_power: None,
        }
    }

    /// Whether the controller currently wants to (dis)charge.
    pub fn charge_intent(&self) -> bool {
        self.charge_intent
    }

    /// Last setpoint the controller asked for, before clamping.
    pub fn requested_setpoint(&self) -> i16 {
        self.requested_setpoint
    }

    /// Last active power read back from the charger.
    pub fn charger_power(&self) -> Option<i16> {
        self.charger_power
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    /// Inspects a request on its way to the charger, rewriting setpoint writes in place.
    pub fn on_request(&mut self, request: &mut Request<'_>) {
        let Request::WriteSingleRegister(addr, word) = request else {
            return;
        };
        match RegisterAddress::from_addr(*addr) {
            Some(RegisterAddress::Action) => self.handle_action(*word),
            Some(RegisterAddress::PowerSetpoint) => *word = self.limit_setpoint(*word),
            _ => {}
        }
    }

    /// Picks the charger's active power out of read responses covering it.
    pub fn on_response(&mut self, request: &Request<'_>, response: &Response) {
        let Request::ReadHoldingRegisters(addr, count) = request else {
            return;
        };
        let target = RegisterAddress::AcActivePowerRms.addr();
        if target < *addr || u32::from(target) >= u32::from(*addr) + u32::from(*count) {
            return;
        }
        let index = usize::from(target - addr);

        match response {
            Response::ReadHoldingRegisters(words) if index < words.len() => {
                let power = decode_signed_power(words[index]);
                debug!("charger active power {}W", power);
                self.charger_power = Some(power);
                self.events.charger_power.publish(i32::from(power));
            }
            other => {
                warn!(
                    "response {:?} does not match read of {} registers at {:#06x}",
                    other, count, addr
                );
            }
        }
    }

    fn handle_action(&mut self, word: u16) {
        match ChargeAction::from_word(word) {
            Some(ChargeAction::Start) => {
                if !self.charge_intent {
                    info!("start (dis)charging");
                }
                self.charge_intent = true;
            }
            Some(ChargeAction::Stop) => {
                if self.charge_intent {
                    info!("stop (dis)charging");
                }
                self.charge_intent = false;
            }
            None => debug!("unknown action {}", word),
        }
    }

    fn limit_setpoint(&mut self, word: u16) -> u16 {
        let requested = decode_signed_power(word);
        self.requested_setpoint = requested;
        let limited = clamp_setpoint(requested, self.limit);
        if limited != requested {
            info!("limited {}W to {}W", requested, limited);
        }
        encode_signed_power(limited)
    }
}

impl<W: SetpointWriter> RateLimiter for RequestInterceptor<W> {
    fn set_limit(&mut self, limit: u32) {
        self.limit = limit;
        info!(
            "set limit to {}W (requested {}W)",
            limit, self.requested_setpoint
        );

        let sign = if self.requested_setpoint < 0 { -1 } else { 1 };
        self.events
            .limit
            .publish(sign * i32::try_from(limit).unwrap_or(i32::MAX));

        if limit < u32::from(self.requested_setpoint.unsigned_abs()) {
            let value = clamp_setpoint(self.requested_setpoint, limit);
            info!("writing new limit {}W to charger", value);
            self.writer.write_setpoint(encode_signed_power(value));
        }
    }

    fn current_limit(&self) -> u32 {
        self.limit
    }
}
