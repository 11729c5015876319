use proc_macro::TokenStream;
use quote::quote;
use syn::{
    Attribute, Data, DeriveInput, Error, Fields, Ident, Lit, LitStr, Meta, MetaNameValue,
    Result, Token, Type, parse_macro_input, punctuated::Punctuated, spanned::Spanned,
};

/// Derives `rillview::Entity` for a struct with named fields.
///
/// Container keys inside `#[entity(...)]`:
/// - `name = "..."`: entity (and table) name, defaults to the struct name in snake case
/// - `identifier = "..."`: identifier field, defaults to `id`
/// - `embedded_identifier`: marks a composite key; providers reject such entities
/// - `detach = "deep_copy" | "invalidate_session"`: defaults to `deep_copy`, which
///   requires `Clone`
///
/// Fields marked `#[entity(skip)]` get no accessor. Property names are the Rust field
/// names, so they must match the serialized names.
#[proc_macro_derive(Entity, attributes(entity))]
pub fn derive_entity(input: TokenStream) -> TokenStream {
    match impl_entity(parse_macro_input!(input as DeriveInput)) {
        Ok(tokens) => tokens,
        Err(err) => err.to_compile_error().into(),
    }
}

fn impl_entity(input: DeriveInput) -> Result<TokenStream> {
    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(named) => &named.named,
            _ => {
                return Err(Error::new(
                    input.span(),
                    "#[derive(Entity)] requires named fields",
                ));
            }
        },
        _ => {
            return Err(Error::new(
                input.span(),
                "#[derive(Entity)] only supports structs",
            ));
        }
    };

    let config = Config::from_attrs(&input.attrs)?;
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let entity_name = config
        .name
        .map(|lit| lit.value())
        .unwrap_or_else(|| snake_case(&name.to_string()));
    let identifier = config
        .identifier
        .as_ref()
        .map(LitStr::value)
        .unwrap_or_else(|| "id".to_string());

    let mut id_type: Option<&Type> = None;
    let mut properties = Vec::new();
    for field in fields {
        let Some(ident) = field.ident.as_ref() else {
            continue;
        };
        let property = field_name(ident);
        if property == identifier {
            id_type = Some(&field.ty);
        }
        if is_skipped(&field.attrs)? {
            if property == identifier {
                return Err(Error::new(
                    field.span(),
                    "the identifier field cannot be skipped",
                ));
            }
            continue;
        }
        properties.push(quote! {
            .property(
                #property,
                |entity: &Self| ::rillview::entity::to_property(&entity.#ident),
                |entity: &mut Self, value: ::rillview::entity::Value| {
                    entity.#ident = ::rillview::entity::from_property(value)?;
                    ::std::result::Result::Ok(())
                },
            )
        });
    }

    let id_type = id_type.ok_or_else(|| {
        let span = config
            .identifier
            .as_ref()
            .map_or_else(proc_macro2::Span::call_site, LitStr::span);
        Error::new(span, format!("no field named `{identifier}` to use as identifier"))
    })?;

    let detacher = match config.detach.as_ref().map(|lit| (lit.value(), lit.span())) {
        None => quote!(::rillview::entity::Detacher::DeepCopy(
            <Self as ::std::clone::Clone>::clone
        )),
        Some((mode, _)) if mode == "deep_copy" => quote!(::rillview::entity::Detacher::DeepCopy(
            <Self as ::std::clone::Clone>::clone
        )),
        Some((mode, _)) if mode == "invalidate_session" => {
            quote!(::rillview::entity::Detacher::InvalidateSession)
        }
        Some((_, span)) => {
            return Err(Error::new(
                span,
                "detach must be \"deep_copy\" or \"invalidate_session\"",
            ));
        }
    };

    let embedded = if config.embedded_identifier {
        quote!(.embedded_identifier())
    } else {
        quote!()
    };

    Ok(quote! {
        impl #impl_generics ::rillview::entity::Entity for #name #ty_generics #where_clause {
            type Id = #id_type;

            fn metadata() -> ::rillview::entity::EntityMetadata<Self> {
                ::rillview::entity::EntityMetadata::builder(#entity_name, #identifier, #detacher)
                    #(#properties)*
                    #embedded
                    .build()
            }
        }
    }
    .into())
}

#[derive(Default)]
struct Config {
    name: Option<LitStr>,
    identifier: Option<LitStr>,
    detach: Option<LitStr>,
    embedded_identifier: bool,
}

impl Config {
    fn from_attrs(attrs: &[Attribute]) -> Result<Self> {
        let mut cfg = Config::default();

        for attr in attrs {
            if !attr.path().is_ident("entity") {
                continue;
            }
            let metas: Punctuated<Meta, Token![,]> =
                attr.parse_args_with(Punctuated::parse_terminated)?;
            for meta in metas {
                match meta {
                    Meta::NameValue(MetaNameValue { path, value, .. }) => {
                        if path.is_ident("name") {
                            cfg.name = Some(expect_str(value, "name")?);
                        } else if path.is_ident("identifier") {
                            cfg.identifier = Some(expect_str(value, "identifier")?);
                        } else if path.is_ident("detach") {
                            cfg.detach = Some(expect_str(value, "detach")?);
                        } else {
                            return Err(Error::new(path.span(), "unsupported entity attribute key"));
                        }
                    }
                    Meta::Path(path) if path.is_ident("embedded_identifier") => {
                        cfg.embedded_identifier = true;
                    }
                    other => {
                        return Err(Error::new(
                            other.span(),
                            "expected `key = value` or `embedded_identifier` in #[entity(...)]",
                        ));
                    }
                }
            }
        }

        Ok(cfg)
    }
}

fn is_skipped(attrs: &[Attribute]) -> Result<bool> {
    let mut skip = false;
    for attr in attrs {
        if !attr.path().is_ident("entity") {
            continue;
        }
        let metas: Punctuated<Meta, Token![,]> =
            attr.parse_args_with(Punctuated::parse_terminated)?;
        for meta in metas {
            match meta {
                Meta::Path(path) if path.is_ident("skip") => skip = true,
                other => {
                    return Err(Error::new(
                        other.span(),
                        "only `skip` is supported on entity fields",
                    ));
                }
            }
        }
    }
    Ok(skip)
}

fn expect_str(expr: syn::Expr, name: &str) -> Result<LitStr> {
    match expr {
        syn::Expr::Lit(expr_lit) => {
            if let Lit::Str(s) = expr_lit.lit {
                Ok(s)
            } else {
                Err(Error::new(
                    expr_lit.span(),
                    format!("{name} must be a string literal"),
                ))
            }
        }
        other => Err(Error::new(
            other.span(),
            format!("{name} must be a string literal"),
        )),
    }
}

fn field_name(ident: &Ident) -> String {
    let name = ident.to_string();
    name.strip_prefix("r#").map(str::to_string).unwrap_or(name)
}

fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}
