use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{parse_macro_input, spanned::Spanned, FnArg, ItemFn, Pat, Signature, Type};

/// Turn an asynchronous test into a synchronous one and inject dependencies.
///
/// Injectable dependencies are a [`rocket::local::asynchronous::Client`]
/// for a server running over a fresh in-memory store, and that
/// `crate::storage::MemoryStore` itself, so tests can seed and inspect data.
///
/// The server uses `crate::Config::example()`, so vote aggregation runs on a
/// short delay.
#[proc_macro_attribute]
pub fn backend_test(_args: TokenStream, input: TokenStream) -> TokenStream {
    let mut item_fn = parse_macro_input!(input as ItemFn);

    // Extract the arguments to inject and reject invalid function signatures.
    let test_args = match check_sig(item_fn.sig.clone()) {
        Ok(args) => args,
        Err(err) => {
            return err.into_compile_error().into();
        }
    };

    // Rename the future so the test can have its original name.
    let name = item_fn.sig.ident.clone();
    let new_name = format_ident!("{}_fut", name);
    item_fn.sig.ident = new_name.clone();

    quote! {
        #[rocket::async_test]
        async fn #name() {
            /// The test itself.
            #item_fn

            // Test setup.
            let store = crate::storage::MemoryStore::new();
            let rocket = crate::rocket_for_storage(
                crate::storage::Storage::memory(store.clone()),
                crate::Config::example(),
            );
            let rocket_client = rocket::local::asynchronous::Client::tracked(rocket)
                .await
                .expect("valid rocket instance");

            #new_name(#(#test_args),*).await;
        }
    }
    .into()
}

/// Ensure the wrapped test is async, extract parameters to inject, and reject unknown parameters.
fn check_sig(sig: Signature) -> Result<Vec<TokenStream2>, syn::Error> {
    if sig.asyncness.is_none() {
        return Err(syn::Error::new(sig.span(), "Test must be marked `async`"));
    }

    let mut has_client = false;
    let mut has_store = false;
    let mut args = vec![];

    for input in &sig.inputs {
        if let FnArg::Typed(pat_type) = input {
            if let Pat::Ident(_) = &*pat_type.pat {
                if let Type::Path(type_path) = &*pat_type.ty {
                    // Valid as the last path segment for any type is itself.
                    let type_ident = &type_path.path.segments.last().unwrap().ident;
                    if type_ident == "Client" {
                        if has_client {
                            return Err(syn::Error::new(
                                input.span(),
                                "Test cannot accept more than one `rocket::local::asynchronous::Client`",
                            ));
                        }
                        has_client = true;
                        args.push(quote! { rocket_client });
                        continue;
                    } else if type_ident == "MemoryStore" {
                        if has_store {
                            return Err(syn::Error::new(
                                input.span(),
                                "Test cannot accept more than one `MemoryStore`",
                            ));
                        }
                        has_store = true;
                        args.push(quote! { store.clone() });
                        continue;
                    }
                }
            }
        }

        return Err(syn::Error::new(
            input.span(),
            "Expected one of `client_ident: Client` or `store_ident: MemoryStore`",
        ));
    }

    Ok(args)
}
