// uLark: featherweight sandboxed scripting runtime.
//
// Copyright (C) 2019  Brandon Lewis
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

extern crate serde;
extern crate serde_json;
#[macro_use]
extern crate lazy_static;

#[macro_use]
pub mod util;

pub mod builtins;
pub mod caps;
pub mod data;
pub mod dict;
pub mod env;
pub mod error;
pub mod hashtable;
pub mod iter;
pub mod list;
pub mod ops;
pub mod safenum;
pub mod thread;
pub mod value;

pub use crate::builtins::{new_builtin, new_builtin_with_caps, Builtin, NativeFn};
pub use crate::caps::{Safety, SafetyFlags, SafetySet};
pub use crate::env::{Env, Module};
pub use crate::error::{Error, Result};
pub use crate::iter::{safe_iterate, SafeIter, ValueIter};
pub use crate::ops::{
    safe_binary, safe_call, safe_compare, safe_get_attr, safe_set_key, safe_to_string,
    safe_unary, SafeStringBuilder,
};
pub use crate::safenum::SafeInt;
pub use crate::thread::{CancelHandle, Frame, Limits, Thread};
pub use crate::value::{BinOp, CompareOp, Foreign, ForeignIter, Side, UnOp, Value};
