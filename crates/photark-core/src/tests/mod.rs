mod account;
mod hashsink;
mod index;
