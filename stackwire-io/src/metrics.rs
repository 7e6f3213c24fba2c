//! Ambient hub instrumentation (SPEC_FULL §2.5). Not a spec.md feature in
//! its own right; the counters here back the observability events the
//! protocol stack emits (spec §4.E "every transition emits a structured
//! event").

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Clone, Default)]
pub struct HubMetrics {
	pub registrations_total: Counter,
	pub active_registrations: Gauge,
	pub readiness_events_total: Counter,
	pub scheduled_tasks_total: Counter,
}

impl HubMetrics {
	pub fn register(registry: &mut Registry) -> Self {
		let metrics = Self::default();
		let sub = registry.sub_registry_with_prefix("stackwire_hub");
		sub.register(
			"registrations",
			"Total transports registered with the hub",
			metrics.registrations_total.clone(),
		);
		sub.register(
			"active_registrations",
			"Transports currently registered",
			metrics.active_registrations.clone(),
		);
		sub.register(
			"readiness_events",
			"Total readiness events dispatched to listeners",
			metrics.readiness_events_total.clone(),
		);
		sub.register(
			"scheduled_tasks",
			"Total tasks scheduled via the hub",
			metrics.scheduled_tasks_total.clone(),
		);
		metrics
	}
}
