//! End-to-end smoke tests for the urlinfo gateway live under `tests/`.
