//! # lfgrant core
//!
//! Dependency-ordered provisioning of Lake Formation tags, tag associations,
//! location registrations and permission grants.
//!
//! Declarations are collected into a [`DeclarationSet`], checked by the
//! validator, turned into a [`DependencyGraph`] by [`plan`], and applied by
//! the [`Executor`] against any [`CatalogService`].

pub mod backend;
pub mod cancel;
pub mod declarations;
pub mod error;
pub mod executor;
pub mod graph;
pub mod operation;
pub mod permissions;
pub mod plan;
pub mod report;
pub mod retry;
pub mod types;
pub mod validate;

pub use backend::*;
pub use cancel::CancelToken;
pub use declarations::*;
pub use error::{Error, ErrorKind, Result};
pub use executor::*;
pub use graph::DependencyGraph;
pub use operation::*;
pub use permissions::*;
pub use plan::{plan, ExecutionPlan};
pub use report::*;
pub use retry::{with_retry_if, RetryConfig};
pub use types::*;
pub use validate::{validate, Validator};
