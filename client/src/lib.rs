// reconciliation engine
pub mod board;

// collaborator seams (rendering surface, approval prompt)
pub mod surface;

// server connection
pub mod session;
