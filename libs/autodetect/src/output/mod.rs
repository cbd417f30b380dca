// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

pub mod flush_listener;
pub mod result_processor;

pub use flush_listener::FlushListener;
pub use result_processor::AutoDetectResultProcessor;
