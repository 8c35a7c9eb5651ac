//! The `InternalEvent` trait.
//!
//! Each crate defines its own event structs next to the code that emits them;
//! this trait is the only shared contract.

/// An occurrence that records one or more metrics when emitted.
pub trait InternalEvent {
    fn emit(self);
}
