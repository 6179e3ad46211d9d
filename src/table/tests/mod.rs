mod helpers;

// Priority 1 — write/read round trips
mod tests_basic;
