use proc_macro::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields, Lit, parse_macro_input};

/// Convert CamelCase to snake_case
fn to_snake_case(s: &str) -> String {
    let mut result = String::with_capacity(s.len() + 4);

    for (i, c) in s.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                result.push('_');
            }
            result.push(c.to_ascii_lowercase());
        } else {
            result.push(c);
        }
    }

    result
}

/// Check if a field has a specific attribute
fn has_attr(field: &syn::Field, attr_name: &str) -> bool {
    field
        .attrs
        .iter()
        .any(|attr| attr.path().is_ident(attr_name))
}

/// Parse #[document(collection = "...")] attribute and return the collection name
fn parse_document_attr(input: &DeriveInput) -> syn::Result<Option<String>> {
    let mut collection = None;
    for attr in &input.attrs {
        if attr.path().is_ident("document") {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("collection") {
                    meta.input.parse::<syn::Token![=]>()?;
                    let lit: Lit = meta.input.parse()?;
                    match lit {
                        Lit::Str(s) => collection = Some(s.value()),
                        other => {
                            return Err(syn::Error::new_spanned(
                                other,
                                "collection must be a string literal",
                            ));
                        }
                    }
                    Ok(())
                } else {
                    Err(meta.error("unsupported document attribute"))
                }
            })?;
        }
    }
    Ok(collection)
}

/// Derive macro for the `Document` trait.
///
/// Requires exactly one named field marked `#[key]`; its type becomes the
/// document's key type. The collection defaults to the snake_case type name
/// and can be set with `#[document(collection = "...")]`.
///
/// ## Example
///
/// ```text
/// #[derive(Clone, Serialize, Deserialize, Document)]
/// #[document(collection = "widgets")]
/// struct Widget {
///     #[key]
///     pub id: String,
///     pub weight: i64,
/// }
/// ```
#[proc_macro_derive(Document, attributes(document, key))]
pub fn derive_document(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand_document(&input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand_document(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let name = &input.ident;
    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => &fields.named,
            _ => {
                return Err(syn::Error::new_spanned(
                    name,
                    "Document only supports structs with named fields",
                ));
            }
        },
        _ => {
            return Err(syn::Error::new_spanned(
                name,
                "Document only supports structs",
            ));
        }
    };

    let mut key_fields = fields.iter().filter(|f| has_attr(f, "key"));
    let key_field = key_fields.next().ok_or_else(|| {
        syn::Error::new_spanned(name, "No field marked with #[key] attribute found")
    })?;
    if let Some(extra) = key_fields.next() {
        return Err(syn::Error::new_spanned(
            extra,
            "Only one field may be marked with #[key]",
        ));
    }
    let key_field_name = key_field
        .ident
        .as_ref()
        .ok_or_else(|| syn::Error::new_spanned(key_field, "#[key] field must be named"))?;
    let key_ty = &key_field.ty;

    let collection =
        parse_document_attr(input)?.unwrap_or_else(|| to_snake_case(&name.to_string()));

    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics document_storage::Document for #name #ty_generics #where_clause {
            type Key = #key_ty;

            fn collection() -> &'static str {
                #collection
            }

            fn key(&self) -> Self::Key {
                ::std::clone::Clone::clone(&self.#key_field_name)
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_snake_case() {
        assert_eq!(to_snake_case("Widget"), "widget");
        assert_eq!(to_snake_case("OrderLine"), "order_line");
    }
}
