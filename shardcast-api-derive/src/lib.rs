use proc_macro::TokenStream;
use syn::{parse_macro_input, DeriveInput};

mod common;
mod unit;

/// Derives the `WorkUnit` trait from an action table.
///
/// Each action name is mapped to an inherent method with the signature
/// `fn(&self, &Payload, &UnitContext) -> UnitResult<Output>`. Invoking an
/// action that is not in the table yields `UnitError::UnknownAction`.
///
/// # Attributes
///
/// - `payload = "Type"` (required): the payload every action receives
/// - `output = "Type"` (required): element type of the result list
/// - `actions(name = "method", ...)` (required): action table
/// - `name = "..."`: static unit name, defaults to the snake_case type name
/// - `name_field = "field"`: read the unit name from a `String` field instead
///
/// # Example
///
/// ```ignore
/// # use shardcast_api::{UnitContext, UnitResult, WorkUnit};
/// #[derive(WorkUnit)]
/// #[work_unit(payload = "String", output = "String", actions(grep = "find_listing"))]
/// struct DirectoryIndexing;
///
/// impl DirectoryIndexing {
///     fn find_listing(&self, body: &String, _ctx: &UnitContext) -> UnitResult<String> {
///         Ok(body.contains("<title>Index of").then(|| "directory listing".to_string()).into_iter().collect())
///     }
/// }
///
/// assert_eq!(DirectoryIndexing::UNIT_NAME, "directory_indexing");
/// ```
///
/// # Generated Items
///
/// - `impl WorkUnit` with `name`, `actions` and `invoke`
/// - `UNIT_NAME` associated constant when the name is static
#[proc_macro_derive(WorkUnit, attributes(work_unit))]
pub fn derive_work_unit(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    TokenStream::from(unit::expand(&input))
}
