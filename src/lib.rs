use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub mod activity;
pub mod config;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod schema;
pub mod sink;
pub mod songplays;
pub mod songs;
pub mod source;
pub mod time;
