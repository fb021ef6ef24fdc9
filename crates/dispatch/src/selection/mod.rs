//! Work request selection
//!
//! Routes persisted requests to process, delete or skip. [`classify`] is the
//! per-request rule; [`RequestSelector`] applies it across store pages.

mod selector;

pub use selector::{
    classify, Condition, Disposition, RequestSelector, SelectedRequest, SelectedRequests,
    SelectorConfig,
};
