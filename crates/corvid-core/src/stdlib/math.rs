//! `math` library

use super::{new_lib, set_raw, LibFn};
use crate::value::Value;
use crate::vm::{VmResult, VM};

const FUNCTIONS: &[(&str, LibFn)] = &[
    ("abs", abs),
    ("ceil", ceil),
    ("floor", floor),
    ("sqrt", sqrt),
    ("max", max),
    ("min", min),
    ("fmod", fmod),
    ("modf", modf),
    ("sign", sign),
    ("clamp", clamp),
    ("exp", exp),
    ("log", log),
    ("pow", pow),
];

pub(crate) fn open(vm: &mut VM) {
    let math = new_lib(vm, "math", FUNCTIONS);
    set_raw(vm, math, "huge", Value::Number(f64::INFINITY));
    set_raw(vm, math, "pi", Value::Number(std::f64::consts::PI));
}

fn unary(vm: &mut VM, f: impl Fn(f64) -> f64) -> VmResult<usize> {
    let x = vm.check_number(1)?;
    vm.push_number(f(x));
    Ok(1)
}

fn abs(vm: &mut VM) -> VmResult<usize> {
    unary(vm, f64::abs)
}

fn ceil(vm: &mut VM) -> VmResult<usize> {
    unary(vm, f64::ceil)
}

fn floor(vm: &mut VM) -> VmResult<usize> {
    unary(vm, f64::floor)
}

fn sqrt(vm: &mut VM) -> VmResult<usize> {
    unary(vm, f64::sqrt)
}

fn exp(vm: &mut VM) -> VmResult<usize> {
    unary(vm, f64::exp)
}

fn sign(vm: &mut VM) -> VmResult<usize> {
    unary(vm, |x| {
        if x > 0.0 {
            1.0
        } else if x < 0.0 {
            -1.0
        } else {
            0.0
        }
    })
}

fn fold(vm: &mut VM, pick: impl Fn(f64, f64) -> bool) -> VmResult<usize> {
    let mut best = vm.check_number(1)?;
    for arg in 2..=vm.arg_count() {
        let x = vm.check_number(arg)?;
        if pick(x, best) {
            best = x;
        }
    }
    vm.push_number(best);
    Ok(1)
}

fn max(vm: &mut VM) -> VmResult<usize> {
    fold(vm, |x, best| x > best)
}

fn min(vm: &mut VM) -> VmResult<usize> {
    fold(vm, |x, best| x < best)
}

fn fmod(vm: &mut VM) -> VmResult<usize> {
    let a = vm.check_number(1)?;
    let b = vm.check_number(2)?;
    vm.push_number(a % b);
    Ok(1)
}

fn modf(vm: &mut VM) -> VmResult<usize> {
    let x = vm.check_number(1)?;
    let integral = x.trunc();
    let fraction = if x.is_infinite() { 0.0 } else { x - integral };
    vm.push_number(integral);
    vm.push_number(fraction);
    Ok(2)
}

fn clamp(vm: &mut VM) -> VmResult<usize> {
    let x = vm.check_number(1)?;
    let low = vm.check_number(2)?;
    let high = vm.check_number(3)?;
    if low > high {
        return Err(vm.arg_error(3, "max must be greater than or equal to min"));
    }
    vm.push_number(x.clamp(low, high));
    Ok(1)
}

fn log(vm: &mut VM) -> VmResult<usize> {
    let x = vm.check_number(1)?;
    let result = if vm.arg(2).is_nil() {
        x.ln()
    } else {
        let base = vm.check_number(2)?;
        if base == 2.0 {
            x.log2()
        } else if base == 10.0 {
            x.log10()
        } else {
            x.ln() / base.ln()
        }
    };
    vm.push_number(result);
    Ok(1)
}

fn pow(vm: &mut VM) -> VmResult<usize> {
    let a = vm.check_number(1)?;
    let b = vm.check_number(2)?;
    vm.push_number(a.powf(b));
    Ok(1)
}

#[cfg(test)]
mod tests {
    use crate::testutil::{run, run_err};

    #[test]
    fn test_rounding() {
        assert_eq!(
            run("return math.floor(-2.5), math.ceil(2.1), math.abs(-4), math.sqrt(16)").unwrap(),
            vec!["-3", "3", "4", "4"]
        );
    }

    #[test]
    fn test_min_max() {
        assert_eq!(run("return math.max(3, 9, -1), math.min(3, 9, -1)").unwrap(), vec!["9", "-1"]);
        assert!(run_err("return math.max()").contains("bad argument #1 to 'max'"));
    }

    #[test]
    fn test_fmod_modf() {
        assert_eq!(run("return math.fmod(7, 3), math.fmod(-7, 3)").unwrap(), vec!["1", "-1"]);
        assert_eq!(run("return math.modf(3.75)").unwrap(), vec!["3", "0.75"]);
        assert_eq!(run("return math.modf(-math.huge)").unwrap(), vec!["-inf", "0"]);
    }

    #[test]
    fn test_sign_clamp() {
        assert_eq!(
            run("return math.sign(-3), math.sign(0), math.sign(2), math.clamp(15, 0, 10), math.clamp(-1, 0, 10)")
                .unwrap(),
            vec!["-1", "0", "1", "10", "0"]
        );
        assert!(run_err("return math.clamp(1, 5, 2)").contains("max must be greater than or equal to min"));
    }

    #[test]
    fn test_constants_and_powers() {
        assert_eq!(
            run("return math.huge > 1e308, math.pi > 3.14 and math.pi < 3.15, math.pow(2, 8), math.log(8, 2), math.exp(0)")
                .unwrap(),
            vec!["true", "true", "256", "3", "1"]
        );
    }
}
