//! nsq-broker - uniform publish/subscribe over NSQ
//!
//! A broker adapter that exposes connect, publish and subscribe over nsqd
//! producers and nsqd/nsqlookupd consumers, with subscriptions that survive
//! reconnects.

pub mod broker;
pub mod config;
pub mod nsq;
pub mod utils;
