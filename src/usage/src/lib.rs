pub mod memory;

#[derive(PartialEq, Copy, Clone, Debug)]
pub enum MemoryKind {
    // resident anonymous pages, counted in pages
    Anonymous,
    // anonymous pages living in swap, counted in pages
    Swapped,
    // amap slot storage, counted in slots
    AmapSlots,
    // per-slot partial reference arrays, counted in slots
    Ppref,
}

#[derive(PartialEq, Copy, Clone, Debug)]
pub enum Event {
    AmapAlloc,
    AmapWipeout,
    AnonAlloc,
    AnonFree,
    ChunkMaterialize,
    ChunkRelease,
    PprefEstablish,
    CowBreak,
    PageIn,
    PageOut,
}
