//! Parallel walkers over the methods of a program.
//!
//! Passes run sequentially, but inside a pass the per-method work is spread over the rayon
//! pool. Each closure receives exclusive access to one method and must not touch any
//! other; results are combined with a commutative reducer.

use rayon::prelude::*;

use crate::model::{DexMethod, Program};

/// Calls `f` on every method, in parallel.
pub fn parallel_methods<F>(program: &mut Program, f: F)
where
    F: Fn(&mut DexMethod) + Sync + Send,
{
    let methods: Vec<&mut DexMethod> = program.methods_mut().collect();
    methods.into_par_iter().for_each(f);
}

/// Calls `f` on every method that has a body, in parallel.
pub fn parallel_code<F>(program: &mut Program, f: F)
where
    F: Fn(&mut DexMethod) + Sync + Send,
{
    parallel_methods(program, |m| {
        if m.code().is_some() {
            f(m);
        }
    });
}

/// Maps every method with a body through `map` in parallel and folds the results with
/// the commutative `reduce`, starting from `R::default()`.
pub fn parallel_reduce<R, F, G>(program: &mut Program, map: F, reduce: G) -> R
where
    R: Default + Send,
    F: Fn(&mut DexMethod) -> R + Sync + Send,
    G: Fn(R, R) -> R + Sync + Send,
{
    let methods: Vec<&mut DexMethod> = program
        .methods_mut()
        .filter(|m| m.code().is_some())
        .collect();
    methods
        .into_par_iter()
        .map(map)
        .reduce(R::default, reduce)
}

/// Read-only variant of [`parallel_reduce`].
pub fn parallel_reduce_ref<R, F, G>(program: &Program, map: F, reduce: G) -> R
where
    R: Default + Send,
    F: Fn(&DexMethod) -> R + Sync + Send,
    G: Fn(R, R) -> R + Sync + Send,
{
    let methods: Vec<&DexMethod> = program.methods().filter(|m| m.code().is_some()).collect();
    methods.into_par_iter().map(map).reduce(R::default, reduce)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::helpers::{class_with_methods, static_method};

    #[test]
    fn test_reduce_counts_bodies() {
        let mut program = Program::from_classes(vec![class_with_methods(
            "LFoo;",
            vec![
                static_method("LFoo;.a:()V", 1, |b| {
                    b.return_void();
                }),
                static_method("LFoo;.b:()V", 1, |b| {
                    b.const_int(0, 1).return_void();
                }),
            ],
        )]);
        let total = parallel_reduce(
            &mut program,
            |m| m.code().map_or(0, |c| c.count_opcodes()),
            |a, b| a + b,
        );
        assert_eq!(total, 3);

        parallel_code(&mut program, |m| {
            if let Some(code) = m.code_mut() {
                code.set_registers_size(code.registers_size() + 1);
            }
        });
        let regs: u32 = parallel_reduce_ref(
            &program,
            |m| m.code().map_or(0, |c| c.registers_size()),
            |a, b| a + b,
        );
        assert!(regs >= 2);
    }
}
