#[path = "e2e/helpers.rs"]
mod helpers;
#[path = "e2e/test_arithmetic.rs"]
mod test_arithmetic;
#[path = "e2e/test_chunks.rs"]
mod test_chunks;
#[path = "e2e/test_closures.rs"]
mod test_closures;
#[path = "e2e/test_control_flow.rs"]
mod test_control_flow;
#[path = "e2e/test_coroutines.rs"]
mod test_coroutines;
#[path = "e2e/test_errors.rs"]
mod test_errors;
#[path = "e2e/test_functions.rs"]
mod test_functions;
#[path = "e2e/test_metamethods.rs"]
mod test_metamethods;
#[path = "e2e/test_strings.rs"]
mod test_strings;
#[path = "e2e/test_tables.rs"]
mod test_tables;
