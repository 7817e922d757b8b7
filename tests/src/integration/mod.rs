//! Cross-module scenarios driven through the [`event_bus::EventBus`] facade.

mod backlog;
mod health;
mod lifecycle;
mod ordering;
mod reconnect;
mod topics;
