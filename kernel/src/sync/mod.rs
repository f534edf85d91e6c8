// =============================================================================
// Cirrus: Kernel Synchronization Primitives
// =============================================================================
//
// Every blocking kernel operation is built from the same three pieces:
//
//   Signaler         owned by the resource that can be waited on
//   Condition        one waiter's interest in one signaler
//   ConditionWaiter  blocks the running thread until one of its
//                    conditions is satisfied
//
// The kernel runs one thread at a time and only switches inside
// ConditionWaiter::wait() or an explicit yield. The spin locks below guard
// against re-entrant mutation from callbacks (a satisfy running while a
// signaler walks its list), not against other cores.
//
// Lock rule: no lock is held while a condition is satisfied or while the
// scheduler is called.
// =============================================================================

pub mod condition;
pub mod cv;
pub mod waiter;

pub use condition::{Condition, Signaler};
pub use cv::CondVar;
pub use waiter::ConditionWaiter;
