pub mod config;
pub mod executor;
pub mod intake;
pub mod migrate;
pub mod mutate;
pub mod namespace;
pub mod pipeline;
pub mod replica;
pub mod resolver;
pub mod runtime;
pub mod scanner;
pub mod store;
pub mod strategy;
pub mod wiki;
pub mod wikitext;
