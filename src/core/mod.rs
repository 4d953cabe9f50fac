// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Small building blocks shared by the server side of the engine.

pub mod handle;
