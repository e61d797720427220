// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared utilities: character-to-token positioning.

pub mod positioning;
