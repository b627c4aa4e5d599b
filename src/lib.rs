pub mod actor;
pub mod catalog;
pub mod config;
pub mod controller;
pub mod dca;
pub mod entity;
pub mod node;
pub mod operator;
pub mod play;
pub mod sim;
pub mod stats;
pub mod voice;
pub mod worker;
