use std::collections::HashMap;

use darling::{FromDeriveInput, FromMeta};
use proc_macro2::TokenStream;
use quote::quote;
use syn::{DeriveInput, Ident, Type};

use crate::common::{format_error_span, to_snake_case};

/// Options accepted by `#[work_unit(...)]`
#[derive(Debug, FromDeriveInput)]
#[darling(attributes(work_unit), supports(struct_any, enum_any))]
pub struct WorkUnitArgs {
    ident: Ident,
    generics: syn::Generics,
    /// Static unit name; defaults to the snake_case type name
    #[darling(default)]
    name: Option<String>,
    /// Field holding the unit name when it is only known at runtime
    #[darling(default)]
    name_field: Option<Ident>,
    /// Payload type, e.g. `payload = "HttpExchange"`
    payload: Type,
    /// Result element type, e.g. `output = "Finding"`
    output: Type,
    /// Action name to method mapping, e.g. `actions(grep = "grep_response")`
    actions: ActionTable,
}

/// `actions(name = "method", ...)`
#[derive(Debug, Default)]
pub struct ActionTable(Vec<(String, Ident)>);

impl FromMeta for ActionTable {
    fn from_list(items: &[darling::ast::NestedMeta]) -> darling::Result<Self> {
        let map = HashMap::<String, Ident>::from_list(items)?;
        let mut entries: Vec<(String, Ident)> = map.into_iter().collect();
        // HashMap order is random; keep generated code stable
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(ActionTable(entries))
    }
}

pub fn expand(input: &DeriveInput) -> TokenStream {
    let args = match WorkUnitArgs::from_derive_input(input) {
        Ok(args) => args,
        Err(err) => return err.write_errors(),
    };

    if args.actions.0.is_empty() {
        return format_error_span(&input.ident, "WorkUnit requires at least one action: #[work_unit(actions(name = \"method\"))]");
    }
    if args.name.is_some() && args.name_field.is_some() {
        return format_error_span(&input.ident, "`name` and `name_field` are mutually exclusive");
    }
    if let Some(name) = &args.name {
        if name.trim().is_empty() {
            return format_error_span(&input.ident, "work unit name must not be empty");
        }
    }

    let ident = &args.ident;
    let payload = &args.payload;
    let output = &args.output;
    let (impl_generics, ty_generics, where_clause) = args.generics.split_for_impl();

    let static_name = match &args.name_field {
        Some(_) => None,
        None => Some(args.name.clone().unwrap_or_else(|| to_snake_case(&ident.to_string()))),
    };

    let name_body = match &args.name_field {
        Some(field) => quote! { &self.#field },
        None => {
            let name = static_name.as_deref().unwrap_or_default();
            quote! { #name }
        }
    };

    let unknown_name = quote! { shardcast_api::WorkUnit::name(self) };

    let action_names: Vec<&String> = args.actions.0.iter().map(|(name, _)| name).collect();
    let methods: Vec<&Ident> = args.actions.0.iter().map(|(_, method)| method).collect();

    let unit_name_const = static_name.as_ref().map(|name| {
        quote! {
            impl #impl_generics #ident #ty_generics #where_clause {
                /// Name under which this unit reports results and failures.
                pub const UNIT_NAME: &'static str = #name;
            }
        }
    });

    quote! {
        impl #impl_generics shardcast_api::WorkUnit for #ident #ty_generics #where_clause {
            type Payload = #payload;
            type Output = #output;

            fn name(&self) -> &str {
                #name_body
            }

            fn actions(&self) -> &[&'static str] {
                &[#(#action_names),*]
            }

            fn invoke(
                &self,
                action: &str,
                payload: &Self::Payload,
                ctx: &shardcast_api::UnitContext,
            ) -> shardcast_api::UnitResult<Self::Output> {
                match action {
                    #( #action_names => self.#methods(payload, ctx), )*
                    other => Err(shardcast_api::UnitError::unknown_action(#unknown_name, other)),
                }
            }
        }

        #unit_name_const
    }
}
