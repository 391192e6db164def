pub mod approvals;
pub mod health;
