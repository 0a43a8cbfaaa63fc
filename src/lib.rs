/*
 * pacsmith - Package resolution and build orchestration for Arch Linux.
 * Copyright (C) 2025  pacsmith contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Package resolution and build orchestration core for Arch Linux
//! front-ends.
//!
//! Data flows one way: [`search`] over both [`sources`], the [`resolver`]
//! turns a target into a [`resolver::BuildPlan`], the [`review`] gate asks a
//! human about every AUR build script, and the [`executor`] runs the plan
//! while appending to the transaction [`log`]. [`session::Session`] wires
//! these together for a front-end.

pub mod logging;

pub mod config;
pub mod error;
pub mod executor;
pub mod log;
pub mod package;
pub mod resolver;
pub mod review;
pub mod search;
pub mod session;
pub mod sources;

pub use config::Config;
pub use error::{PacsmithError, PacsmithResult, ResolutionError};
pub use session::Session;
