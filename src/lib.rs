pub use axonic_internal::*;
