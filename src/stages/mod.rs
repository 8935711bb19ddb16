//! Built-in stages.
//!
//! | name         | stage                        |
//! |--------------|------------------------------|
//! | `identity`   | [`Identity`]                 |
//! | `from_json`  | [`json::FromJson`]           |
//! | `to_json`    | [`json::ToJson`]             |
//! | `title_id`   | [`escape::TitleEscape::id`]  |
//! | `title_slug` | [`escape::TitleEscape::slug`]|
//! | `group`      | [`group::Group::counting`]   |
//! | `moments`    | [`moments::Moments`]         |

/// Wikipedia title escaping.
pub mod escape;
/// Keyed grouping.
pub mod group;
/// JSON conversion.
pub mod json;
/// Online statistics per key.
pub mod moments;

pub use escape::TitleEscape;
pub use group::{
  Accumulator, AccumulatorFactory, CountFactory, Group, GroupConfig, GroupKey, KeySelector,
  WindowPolicy,
};
pub use json::{FromJson, ToJson};
pub use moments::{Moments, MomentsConfig, MomentsFactory, Summary};

use crate::stage::Stage;

/// Passes every record through unchanged.
#[derive(Debug, Default)]
pub struct Identity;

impl Stage for Identity {
  fn name(&self) -> &str {
    "identity"
  }
}
