pub mod answer;
pub mod models;
pub mod prompts;
pub mod settings;
