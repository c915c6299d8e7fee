// Anonymous memory for a virtual memory system. Pages of private and shared
// anonymous mappings live in anons; amaps arrange anons into slot arrays that
// map entries reference through arefs. Forks share amaps and anons lazily and
// writes break the sharing page by page.

mod amap;
mod anon;
mod aref;
mod chunk;
mod context;
pub mod cow;
mod entry;
mod fault;
mod ppref;
mod swapoff;

pub use amap::{Amap, AmapRef, AmapState, RefFlags};
pub use anon::{Anon, AnonPageGuard, AnonPool, AnonRef, AnonState};
pub use aref::Aref;
pub use context::{NullPmap, Pmap, Vm, VmOpts};
pub use cow::{copy, copy_private, cow_now, extend, share, share_protect, splitref};
pub use entry::MapEntry;
pub use fault::{handle_fault, FaultKind, FaultOutcome};
pub use swapoff::anon_swap_off;
