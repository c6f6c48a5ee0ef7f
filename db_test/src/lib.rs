use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{parse_macro_input, spanned::Spanned, FnArg, ItemFn, Pat, Signature, Type};

/// Run an asynchronous test against a real MongoDB server, inject
/// dependencies, and drop the test database however the test terminates.
///
/// Injectable dependencies are a [`mongodb::Database`] with every index in
/// place, and a `crate::storage::MongoStore` over it. Each test gets its own
/// randomly named database on the server configured as `db_uri`.
///
/// These tests are ignored by default, since they need that server; run them
/// with `cargo test -- --ignored`.
#[proc_macro_attribute]
pub fn db_test(_args: TokenStream, input: TokenStream) -> TokenStream {
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
        #[test]
        #[ignore = "needs a MongoDB server at `db_uri`"]
        fn #name() {
            /// The test itself.
            #item_fn

            /// Test cleanup.
            async fn cleanup(db: mongodb::Database) {
                db.drop(None).await.unwrap();
            }

            // Create an async runtime. We need a separate one for inside and
            // outside the `catch_unwind`.
            let outer_runtime = rocket::tokio::runtime::Builder::new_multi_thread()
                .thread_name("test-setup-cleanup")
                .worker_threads(1)
                .enable_all()
                .build()
                .unwrap();
            let inner_runtime = rocket::tokio::runtime::Builder::new_multi_thread()
                .thread_name("db-test-thread")
                .worker_threads(1)
                .enable_all()
                .build()
                .unwrap();

            // Run the setup.
            let db = outer_runtime.block_on(crate::storage::test_database());

            // Run the test, catching any panics.
            // Use mutexes to safely transfer `!UnwindSafe` data.
            let db_mutex = std::sync::Mutex::new(db.clone());
            let runtime_mutex = std::sync::Mutex::new(inner_runtime);
            let result = std::panic::catch_unwind(|| {
                let db = db_mutex.into_inner().unwrap();
                let runtime = runtime_mutex.into_inner().unwrap();
                let store = crate::storage::MongoStore::new(&db);

                runtime.block_on(#new_name(#(#test_args),*));
            });

            // Run the cleanup.
            outer_runtime.block_on(cleanup(db));

            // If the test panicked, re-raise the panic.
            if let Err(cause) = result {
                std::panic::panic_any(cause);
            }
        }
    }
    .into()
}

/// Ensure the wrapped test is async, extract parameters to inject, and reject unknown parameters.
fn check_sig(sig: Signature) -> Result<Vec<TokenStream2>, syn::Error> {
    if sig.asyncness.is_none() {
        return Err(syn::Error::new(sig.span(), "Test must be marked `async`"));
    }

    let mut has_db = false;
    let mut has_store = false;
    let mut args = vec![];

    for input in &sig.inputs {
        if let FnArg::Typed(pat_type) = input {
            if let Pat::Ident(_) = &*pat_type.pat {
                if let Type::Path(type_path) = &*pat_type.ty {
                    if let Some(type_ident) = type_path.path.get_ident() {
                        if type_ident == "Database" {
                            if has_db {
                                return Err(syn::Error::new(
                                    input.span(),
                                    "Test cannot accept more than one `mongodb::Database`",
                                ));
                            }
                            has_db = true;
                            args.push(quote! { db.clone() });
                            continue;
                        } else if type_ident == "MongoStore" {
                            if has_store {
                                return Err(syn::Error::new(
                                    input.span(),
                                    "Test cannot accept more than one `MongoStore`",
                                ));
                            }
                            has_store = true;
                            args.push(quote! { store.clone() });
                            continue;
                        }
                    }
                }
            }
        }

        return Err(syn::Error::new(
            input.span(),
            "Expected one of `db_ident: Database` or `store_ident: MongoStore`",
        ));
    }

    Ok(args)
}
