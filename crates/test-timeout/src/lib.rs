//! Test attributes that fail a test instead of letting it hang.
//!
//! `#[test_timeout::timeout(N)]` wraps a synchronous test and
//! `#[test_timeout::tokio_timeout_test(N)]` an async one. `N` is in seconds
//! and defaults to 60. The body runs on its own thread so a blocked body
//! cannot stall the harness.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

fn parse_timeout(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(secs)
}

fn path_is(attr: &Attribute, expected: &[&str]) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    segments.len() == expected.len() && segments.iter().zip(expected).all(|(a, b)| a == b)
}

/// Runs `run_body` on a worker thread and waits at most `secs` for it.
fn watchdog(item: ItemFn, secs: u64, run_body: TokenStream2) -> TokenStream2 {
    let ItemFn { attrs, vis, sig, .. } = item;
    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let __limit = ::std::time::Duration::from_secs(#secs);
            let (__tx, __rx) = ::std::sync::mpsc::channel();
            ::std::thread::spawn(move || {
                let __outcome = ::std::panic::catch_unwind(
                    ::std::panic::AssertUnwindSafe(move || #run_body),
                );
                let _ = __tx.send(__outcome);
            });
            match __rx.recv_timeout(__limit) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => ::std::panic::resume_unwind(payload),
                Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded {}s", #secs)
                }
                Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread ended without reporting")
                }
            }
        }
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = match parse_timeout(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let mut item = parse_macro_input!(item as ItemFn);
    if item.sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &item.sig.ident,
            "tokio_timeout_test can only be applied to async functions"
        )
        .to_compile_error()
        .into();
    }
    item.sig.asyncness = None;
    item.attrs.retain(|attr| !path_is(attr, &["tokio", "test"]));

    let block = item.block.clone();
    let run_body = quote! {{
        let __runtime = ::tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        __runtime.block_on(async move {
            ::tokio::time::timeout(__limit, async move #block)
                .await
                .expect("test timed out");
        });
    }};
    watchdog(item, secs, run_body).into()
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = match parse_timeout(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let mut item = parse_macro_input!(item as ItemFn);
    if item.sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &item.sig.ident,
            "timeout attribute expects a synchronous test function"
        )
        .to_compile_error()
        .into();
    }
    item.attrs.retain(|attr| !path_is(attr, &["test"]));

    let block = item.block.clone();
    watchdog(item, secs, quote! { #block }).into()
}
