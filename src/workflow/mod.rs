pub mod engine;
pub mod integration;
pub mod rules;
pub mod timers;
