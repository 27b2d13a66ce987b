// Common utility functions shared by the derive macros

/// Helper function for error handling in derived macros
pub fn format_error_span<T: quote::ToTokens>(item: &T, message: &str) -> proc_macro2::TokenStream {
    syn::Error::new_spanned(item, message).to_compile_error()
}

/// Turn a type name such as `DirectoryIndexing` into `directory_indexing`.
pub fn to_snake_case(ident: &str) -> String {
    let mut out = String::with_capacity(ident.len() + 4);
    let mut prev_lower = false;
    for ch in ident.chars() {
        if ch.is_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
            prev_lower = false;
        } else {
            out.push(ch);
            prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        }
    }
    out
}
