// ── Reactive state storage ──

mod state_store;

pub(crate) use state_store::StateStore;
