// # Bus Module Trait
//
// Defines the callbacks an application module implements.
//
// Every hook receives the module's [`Bus`] so it can publish messages and
// add or remove listeners while handling an event. Hooks return
// `anyhow::Result`; an error is logged by the client together with the hook
// name and never stops message processing.
//
// ## Usage
//
// ```rust,ignore
// use housebus_core::{Bus, BusModule, Message};
//
// struct Thermostat;
//
// #[async_trait::async_trait]
// impl BusModule for Thermostat {
//     async fn on_init(&mut self, bus: &mut Bus) -> anyhow::Result<()> {
//         bus.add_configuration_listener("house", None, true).await;
//         Ok(())
//     }
//
//     async fn on_message(&mut self, bus: &mut Bus, message: &Message) -> anyhow::Result<()> {
//         println!("{}", message);
//         Ok(())
//     }
//
//     async fn on_configuration(&mut self, _bus: &mut Bus, message: &Message) -> anyhow::Result<()> {
//         println!("configuration {}", message.args);
//         Ok(())
//     }
// }
// ```

use async_trait::async_trait;

use crate::bus::Bus;
use crate::message::Message;

/// Trait for application modules driven by a [`BusClient`](crate::BusClient)
///
/// Only `on_message` and `on_configuration` are mandatory; the lifecycle
/// hooks default to doing nothing.
#[async_trait]
pub trait BusModule: Send {
    /// Called once by `start()` before connecting
    ///
    /// Register listeners here. Configuration listeners registered with
    /// `wait_for_it` hold back `on_start` until they are satisfied.
    async fn on_init(&mut self, _bus: &mut Bus) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called after every successful (re)connect, before pending
    /// subscriptions are replayed and queued messages flushed
    async fn on_connect(&mut self, _bus: &mut Bus) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called right before `on_start`
    async fn on_pre_start(&mut self, _bus: &mut Bus) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once all mandatory configuration has arrived
    ///
    /// Skipped when `on_pre_start` fails.
    async fn on_start(&mut self, _bus: &mut Bus) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called right after a successful `on_start`
    async fn on_post_start(&mut self, _bus: &mut Bus) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called for every message addressed to the module once configured
    async fn on_message(&mut self, bus: &mut Bus, message: &Message) -> anyhow::Result<()>;

    /// Called for every configuration delivered by the config authority
    async fn on_configuration(&mut self, bus: &mut Bus, message: &Message)
        -> anyhow::Result<()>;

    /// Called after the connection is closed or lost
    async fn on_disconnect(&mut self, _bus: &mut Bus) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called by `stop()` before disconnecting
    async fn on_stop(&mut self, _bus: &mut Bus) -> anyhow::Result<()> {
        Ok(())
    }
}
