use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use foldhash::{HashMap, HashMapExt};
use tracing::debug;

use crate::router::{Route, RouteCounters, RouteMode, RouterInner};
use crate::{
    DestinationHandler, DestinationId, Error, MonotonicTicks, Packet, Queue, Result, Router,
    Signal, TickSource,
};

/// Builder for creating an instance of [`Router`].
///
/// Registrations are validated as they are added, so a misconfigured destination is reported at
/// the call that registers it. Registrations cannot change once the router is built.
#[must_use]
pub struct RouterBuilder {
    routes: HashMap<DestinationId, Route>,
    ticks: Option<Box<dyn TickSource>>,
}

impl RouterBuilder {
    pub(crate) fn new() -> Self {
        Self {
            routes: HashMap::new(),
            ticks: None,
        }
    }

    /// Registers a queued destination.
    ///
    /// Submitted packets are appended to `queue` and `signal` is raised for each one. A consumer
    /// waiting on the signal drains the queue with [`Router::dispatch_one()`] or
    /// [`Router::dispatch_pending()`], which invoke `handler`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if `destination` is already registered or the signal
    /// has no bits.
    pub fn register_destination(
        mut self,
        destination: DestinationId,
        handler: impl DestinationHandler,
        signal: Signal,
        queue: Queue<Packet>,
    ) -> Result<Self> {
        if signal.bits() == 0 {
            return Err(Error::configuration(format!(
                "{destination} must be signalled with at least one event bit"
            )));
        }

        self.insert(
            destination,
            Route {
                handler: Box::new(handler),
                mode: RouteMode::Queued { queue, signal },
                counters: Arc::new(RouteCounters::default()),
            },
        )?;

        Ok(self)
    }

    /// Registers a direct destination, whose handler is invoked inline by the submitter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if `destination` is already registered.
    pub fn register_direct(
        mut self,
        destination: DestinationId,
        handler: impl DestinationHandler,
    ) -> Result<Self> {
        self.insert(
            destination,
            Route {
                handler: Box::new(handler),
                mode: RouteMode::Direct,
                counters: Arc::new(RouteCounters::default()),
            },
        )?;

        Ok(self)
    }

    /// Sets the tick source used to measure queue delays. Defaults to [`MonotonicTicks`].
    pub fn tick_source(mut self, ticks: impl TickSource + 'static) -> Self {
        self.ticks = Some(Box::new(ticks));
        self
    }

    fn insert(&mut self, destination: DestinationId, route: Route) -> Result<()> {
        if self.routes.contains_key(&destination) {
            return Err(Error::configuration(format!(
                "{destination} is already registered"
            )));
        }

        debug!(
            %destination,
            direct = matches!(route.mode, RouteMode::Direct),
            "destination registered"
        );

        self.routes.insert(destination, route);
        Ok(())
    }

    /// Builds the router.
    pub fn build(self) -> Router {
        Router::from_inner(RouterInner {
            routes: self.routes,
            ticks: self
                .ticks
                .unwrap_or_else(|| Box::new(MonotonicTicks::new())),
        })
    }
}

impl fmt::Debug for RouterBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("routes", &self.routes)
            .field("custom_ticks", &self.ticks.is_some())
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::{Delivery, FlagGroup, NodePool};

    const D1: DestinationId = DestinationId(1);

    fn signal(bits: u32) -> Signal {
        Signal::new(Arc::new(FlagGroup::new()), bits)
    }

    #[test]
    fn duplicate_destination_is_rejected() {
        let nodes = NodePool::new(4).unwrap();

        let result = Router::builder()
            .register_destination(D1, Delivery::complete, signal(1), Queue::new(&nodes).unwrap())
            .unwrap()
            .register_direct(D1, Delivery::complete);

        match result {
            Err(Error::Configuration { problem }) => {
                assert!(problem.contains("destination 1"));
            }
            other => panic!("expected a configuration error, got {other:?}"),
        }
    }

    #[test]
    fn zero_signal_bits_are_rejected() {
        let nodes = NodePool::new(4).unwrap();

        let result = Router::builder().register_destination(
            D1,
            Delivery::complete,
            signal(0),
            Queue::new(&nodes).unwrap(),
        );

        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[test]
    fn rejected_registration_releases_queue() {
        let nodes = NodePool::new(1).unwrap();

        let result = Router::builder().register_destination(
            D1,
            Delivery::complete,
            signal(0),
            Queue::new(&nodes).unwrap(),
        );
        drop(result);

        assert_eq!(nodes.available(), 1);
    }

    #[test]
    fn destinations_are_independent() {
        let nodes = NodePool::new(4).unwrap();

        let router = Router::builder()
            .register_destination(D1, Delivery::complete, signal(1), Queue::new(&nodes).unwrap())
            .unwrap()
            .register_direct(DestinationId(2), Delivery::complete)
            .unwrap()
            .build();

        assert!(router.is_registered(D1));
        assert!(router.is_registered(DestinationId(2)));
        assert!(!router.is_registered(DestinationId(3)));
    }
}
