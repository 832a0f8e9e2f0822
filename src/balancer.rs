//! The control loop tying the interceptor and the rate controller together.
//!
//! All state lives in one task. Proxy requests, household power samples, timer expiries and the
//! power watchdog are handled there one at a time, so none of it needs locking. Nothing in the
//! loop waits on the charger: forwarding happens in the proxy's connection tasks and proactive
//! setpoint pushes are spawned by the [`SetpointWriter`].

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};
use tokio_modbus::prelude::{Request, Response};
use tracing::{error, info, warn};

use crate::controller::{ControllerSettings, Phase, RateController};
use crate::error::{Error, Result};
use crate::events::Events;
use crate::interceptor::{RateLimiter, RequestInterceptor, SetpointWriter};
use crate::proxy::PduHook;
use crate::scheduler::{TimerHandle, TokioScheduler};

const COMMAND_CAPACITY: usize = 64;

#[derive(Debug)]
enum Command {
    Intercept {
        request: Request<'static>,
        reply: oneshot::Sender<Request<'static>>,
    },
    Observe {
        request: Request<'static>,
        response: Response,
    },
    PowerSample(i32),
    Status(oneshot::Sender<Status>),
}

/// Snapshot of the control loop state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub limit: u32,
    pub charge_intent: bool,
    pub requested_setpoint: i16,
    pub charger_power: Option<i16>,
    pub phase: Phase,
}

/// Cloneable entry point into a running [`LoadBalancer`].
#[derive(Debug, Clone)]
pub struct BalancerHandle {
    tx: mpsc::Sender<Command>,
}

impl BalancerHandle {
    /// Delivers a household total power measurement, in Watts.
    pub async fn submit_power_sample(&self, watts: i32) -> Result<()> {
        self.tx
            .send(Command::PowerSample(watts))
            .await
            .map_err(|_| Error::Stopped)
    }

    pub async fn status(&self) -> Result<Status> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Status(reply))
            .await
            .map_err(|_| Error::Stopped)?;
        rx.await.map_err(|_| Error::Stopped)
    }
}

impl PduHook for BalancerHandle {
    async fn on_request(&self, request: Request<'static>) -> Option<Request<'static>> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(Command::Intercept { request, reply })
            .await
            .is_err()
        {
            error!("load balancer stopped, refusing request");
            return None;
        }
        rx.await.ok()
    }

    async fn on_response(&self, request: Request<'static>, response: Response) {
        let _ = self.tx.send(Command::Observe { request, response }).await;
    }
}

pub struct LoadBalancer<W> {
    interceptor: RequestInterceptor<W>,
    controller: RateController<TokioScheduler>,
    commands: mpsc::Receiver<Command>,
    timers: mpsc::UnboundedReceiver<TimerHandle>,
    events: Events,
    total_power_timeout: Duration,
}

impl<W: SetpointWriter> LoadBalancer<W> {
    /// Builds the loop with the limit at `max_charge_power`. Must be called inside a tokio runtime.
    pub fn new(
        settings: ControllerSettings,
        total_power_timeout: Duration,
        writer: W,
        events: Events,
    ) -> (Self, BalancerHandle) {
        let (scheduler, timers) = TokioScheduler::new();
        let (tx, commands) = mpsc::channel(COMMAND_CAPACITY);

        let mut interceptor = RequestInterceptor::new(writer, events.clone());
        interceptor.set_limit(settings.max_charge_power);

        let balancer = Self {
            interceptor,
            controller: RateController::new(settings, scheduler),
            commands,
            timers,
            events,
            total_power_timeout,
        };
        (balancer, BalancerHandle { tx })
    }

    /// Runs until every [`BalancerHandle`] is dropped.
    pub async fn run(mut self) {
        let timeout = self.total_power_timeout;
        let watchdog = time::sleep(timeout);
        tokio::pin!(watchdog);
        let mut power_missing = false;

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        info!("all handles dropped, stopping load balancer");
                        break;
                    };
                    if let Command::PowerSample(_) = command {
                        watchdog.as_mut().reset(Instant::now() + timeout);
                        if power_missing {
                            power_missing = false;
                            self.events.total_power_missing.publish(false);
                        }
                    }
                    self.handle(command);
                }
                Some(timer) = self.timers.recv() => {
                    self.controller.on_timer(timer, &mut self.interceptor);
                }
                () = &mut watchdog => {
                    warn!("no new total power received for more than {:?}", timeout);
                    power_missing = true;
                    self.events.total_power_missing.publish(true);
                    watchdog.as_mut().reset(Instant::now() + timeout);
                }
            }
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Intercept { mut request, reply } => {
                self.interceptor.on_request(&mut request);
                let _ = reply.send(request);
            }
            Command::Observe { request, response } => {
                self.interceptor.on_response(&request, &response);
            }
            Command::PowerSample(watts) => {
                self.controller.on_power_sample(watts, &self.interceptor);
            }
            Command::Status(reply) => {
                let _ = reply.send(Status {
                    limit: self.interceptor.current_limit(),
                    charge_intent: self.interceptor.charge_intent(),
                    requested_setpoint: self.interceptor.requested_setpoint(),
                    charger_power: self.interceptor.charger_power(),
                    phase: self.controller.phase(),
                });
            }
        }
    }
}
