// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod channel;
pub mod classifier;
pub mod config;
pub mod delivery;
pub mod dispatcher;
pub mod engine;
pub mod errors;
pub mod flow;
pub mod handler;
pub mod ledger;
pub mod outcome;
pub mod policy;
pub mod queue;
pub mod sink;
