//! Collection operators: `size`, `@in`, and indexing `_[_]_`

use crate::env::Env;
use crate::functions::Overload;
use crate::types::CelType;
use crate::value::Value;
use std::sync::Arc;

fn size(args: &[Value]) -> Value {
    match args[0].size() {
        Ok(n) => Value::Int(n),
        Err(e) => Value::Error(Arc::new(e)),
    }
}

fn membership(args: &[Value]) -> Value {
    args[1].contains(&args[0])
}

fn index(args: &[Value]) -> Value {
    args[0].index(&args[1])
}

pub fn register(env: &mut Env) {
    use CelType::{Double, Int, Uint};
    let a = || CelType::type_param("A");
    let b = || CelType::type_param("B");

    env.register_function(
        "size",
        vec![
            Overload::global("size_string", vec![CelType::String], Int).with_impl(size),
            Overload::global("size_bytes", vec![CelType::Bytes], Int).with_impl(size),
            Overload::global("size_list", vec![CelType::list_of(a())], Int)
                .with_type_params(&["A"])
                .with_impl(size),
            Overload::global("size_map", vec![CelType::map_of(a(), b())], Int)
                .with_type_params(&["A", "B"])
                .with_impl(size),
            Overload::member("string_size", vec![CelType::String], Int).with_impl(size),
            Overload::member("bytes_size", vec![CelType::Bytes], Int).with_impl(size),
            Overload::member("list_size", vec![CelType::list_of(a())], Int)
                .with_type_params(&["A"])
                .with_impl(size),
            Overload::member("map_size", vec![CelType::map_of(a(), b())], Int)
                .with_type_params(&["A", "B"])
                .with_impl(size),
        ],
    );

    // Membership is heterogeneous: `3 in [1.0, 2.0, 3.0]` is true via
    // cross-numeric equality, so the container element type is dyn.
    env.register_function(
        "@in",
        vec![
            Overload::global(
                "in_list",
                vec![CelType::Dyn, CelType::list_of(CelType::Dyn)],
                CelType::Bool,
            )
            .with_impl(membership),
            Overload::global(
                "in_map",
                vec![CelType::Dyn, CelType::map_of(CelType::Dyn, CelType::Dyn)],
                CelType::Bool,
            )
            .with_impl(membership),
        ],
    );

    env.register_function(
        "_[_]_",
        vec![
            Overload::global("index_list", vec![CelType::list_of(a()), Int], a())
                .with_type_params(&["A"])
                .with_impl(index),
            Overload::global("index_list_uint", vec![CelType::list_of(a()), Uint], a())
                .with_type_params(&["A"])
                .with_impl(index),
            Overload::global("index_list_double", vec![CelType::list_of(a()), Double], a())
                .with_type_params(&["A"])
                .with_impl(index),
            Overload::global("index_map", vec![CelType::map_of(a(), b()), a()], b())
                .with_type_params(&["A", "B"])
                .with_impl(index),
        ],
    );
}
