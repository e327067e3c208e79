pub mod breakdowns;
pub mod health;
pub mod items;
pub mod projects;
