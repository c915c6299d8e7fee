// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

// Small helpers shared by every crate of the workspace: the error type that
// crosses crate boundaries, half-open ranges and a few bit tricks.
pub mod bit;
mod range;
mod sys_error;

pub use range::*;
pub use sys_error::*;
