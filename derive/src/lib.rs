//! # entitydb Derive Macros
//!
//! Provides `#[derive(Component)]`, which implements
//! `entitydb::registry::Component` for a struct by inspecting its named
//! fields and emitting a `PropertySchema`: one `PropertyDescriptor` per
//! field, with its `PropertyKind` inferred from the field's Rust type and
//! its `indexed` flag set by an optional `#[indexed]` field attribute.
//!
//! Descended from the teacher crate's `JsonSchema` derive, which walked a
//! struct's fields with `derive_util::StructVisitor` to build a JSON Schema
//! document; here the same traversal builds a `PropertySchema` instead,
//! since components don't need a full JSON Schema — just enough field
//! metadata to drive DDL and expression indexes (spec §4.A).
//!
//! ### Example
//!
//! ```ignore
//! #[derive(entitydb_derive::Component)]
//! struct Position {
//!     x: f64,
//!     y: f64,
//!     #[indexed]
//!     zone: String,
//! }
//! ```

#![recursion_limit = "128"]

extern crate proc_macro;
#[macro_use]
extern crate quote;
extern crate syn;

use syn::{parse_macro_input, DeriveInput};

use derive_util::StructVisitor;

/// Derives `entitydb::registry::Component` for a struct with named fields.
#[proc_macro_derive(Component, attributes(indexed))]
pub fn derive_component(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let ty_name = input.ident;
    let ty_name_str = ty_name.to_string();
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let fields = match input.data {
        syn::Data::Struct(ref ds) => {
            let mut visitor = PropertySchemaVisitor;
            visitor.visit_struct(&ty_name, ds)
        }
        syn::Data::Enum(_) => {
            panic!("Component can only be derived for structs with named fields, not enums");
        }
        syn::Data::Union(_) => {
            panic!("Component can only be derived for structs with named fields, not unions");
        }
    };

    let generated = quote! {
        impl #impl_generics entitydb::registry::Component for #ty_name #ty_generics #where_clause {
            const NAME: &'static str = #ty_name_str;

            fn property_schema() -> entitydb::registry::PropertySchema {
                entitydb::registry::PropertySchema {
                    fields: vec![#(#fields),*],
                }
            }
        }
    };
    generated.into()
}

struct PropertySchemaVisitor;

impl StructVisitor for PropertySchemaVisitor {
    type Output = Vec<proc_macro2::TokenStream>;

    fn visit_struct_named_fields(
        &mut self,
        _ty_name: &syn::Ident,
        _ds: &syn::DataStruct,
        fields: &syn::FieldsNamed,
    ) -> Self::Output {
        fields
            .named
            .iter()
            .filter_map(|field| {
                let field_ident = field.ident.as_ref()?;
                let field_name = field_ident.to_string();
                let field_name = field_name.strip_prefix("r#").unwrap_or(&field_name).to_string();
                let kind = property_kind_tokens(&field.ty);
                let indexed = field.attrs.iter().any(|attr| attr.path.is_ident("indexed"));

                Some(quote! {
                    entitydb::registry::PropertyDescriptor {
                        name: #field_name.to_string(),
                        kind: #kind,
                        indexed: #indexed,
                    }
                })
            })
            .collect()
    }
}

/// Infers a `PropertyKind` variant from a field's Rust type, unwrapping a
/// single layer of `Option<_>` first (an absent optional field is still
/// represented by its inner kind — the schema records shape, not
/// nullability).
fn property_kind_tokens(ty: &syn::Type) -> proc_macro2::TokenStream {
    let ident = innermost_ident(ty);
    match ident.as_deref() {
        Some("bool") => quote! { entitydb::registry::PropertyKind::Bool },
        Some(
            "i8" | "i16" | "i32" | "i64" | "i128" | "isize" | "u8" | "u16" | "u32" | "u64"
            | "u128" | "usize",
        ) => quote! { entitydb::registry::PropertyKind::Integer },
        Some("f32" | "f64") => quote! { entitydb::registry::PropertyKind::Float },
        Some("String" | "str") => quote! { entitydb::registry::PropertyKind::String },
        Some("DateTime" | "NaiveDateTime") => quote! { entitydb::registry::PropertyKind::Timestamp },
        _ => quote! { entitydb::registry::PropertyKind::Json },
    }
}

/// Returns the final path segment's identifier, unwrapping `Option<T>` to
/// `T` if present (e.g. `Option<f64>` -> `"f64"`, `Vec<String>` -> `"Vec"`).
fn innermost_ident(ty: &syn::Type) -> Option<String> {
    let syn::Type::Path(type_path) = ty else {
        return None;
    };
    let segment = type_path.path.segments.last()?;
    let ident = segment.ident.to_string();

    if ident == "Option" {
        if let syn::PathArguments::AngleBracketed(args) = &segment.arguments {
            if let Some(syn::GenericArgument::Type(inner)) = args.args.first() {
                return innermost_ident(inner);
            }
        }
        return None;
    }

    Some(ident)
}
