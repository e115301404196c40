// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reading synthesis from device-type templates.
//!
//! A template is a JSON document keyed by device type name:
//!
//! ```json
//! {
//!   "temperature": { "range": "-10~40" },
//!   "soil_npk": {
//!     "nitrogen": { "range": "10~20" },
//!     "phosphorus": { "range": "5~15" },
//!     "potassium": { "range": "100~300" }
//!   }
//! }
//! ```
//!
//! [`RangeSpec`] turns a `range` field into a value and [`ReadingBuilder`]
//! assembles the per-type reading set, its store fields, and the published
//! [`ReadingMessage`].

mod range;
mod reading;

pub use range::{RangeSpec, fallback_value, synthesize, synthesize_with};
pub use reading::{Reading, ReadingBuilder, ReadingKind, ReadingMessage, ReadingSet};
