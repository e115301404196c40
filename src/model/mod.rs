// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Data model shared by the registries and collaborators.
//!
//! - [`DeviceId`]: identifier of a simulated device (a numeric string)
//! - [`DeviceInfo`]: immutable snapshot returned by the relational lookup
//! - [`TaskId`] / [`WorkerId`]: identities of live producer tasks and
//!   consumer workers, fresh for every (re)start

mod device_id;
mod device_info;
mod handle_id;

pub use device_id::DeviceId;
pub use device_info::DeviceInfo;
pub use handle_id::{TaskId, WorkerId};
