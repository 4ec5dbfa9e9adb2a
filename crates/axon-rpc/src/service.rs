use std::{collections::BTreeMap, rc::Rc};

use axon_ser::{FromSi, SerializationInfo, ToSi, to_si};

use crate::{RemoteError, RpcError};

/// A server-side procedure: a parse/invoke/serialize pipeline around a
/// native callable.
///
/// The transport decodes the arguments into SI nodes, `invoke` converts
/// them to native types, runs the callable and decomposes the result.
pub trait ServiceProcedure {
    fn arity(&self) -> usize;
    fn invoke(&self, args: &[SerializationInfo]) -> Result<SerializationInfo, RemoteError>;
}

/// A name → procedure registry, shared by all transports.
///
/// Registration rejects duplicate names; lookup is O(log n).
#[derive(Default)]
pub struct Service {
    procedures: BTreeMap<String, Rc<dyn ServiceProcedure>>,
}

impl Service {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_procedure(
        &mut self,
        name: impl Into<String>,
        procedure: Rc<dyn ServiceProcedure>,
    ) -> Result<(), RpcError> {
        let name = name.into();
        if self.procedures.contains_key(&name) {
            return Err(RpcError::DuplicateProcedure(name));
        }
        self.procedures.insert(name, procedure);
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Option<Rc<dyn ServiceProcedure>> {
        self.procedures.get(name).cloned()
    }

    pub fn procedure_names(&self) -> impl Iterator<Item = &str> {
        self.procedures.keys().map(String::as_str)
    }
}

macro_rules! procedure_arity {
    ($regname:ident, $structname:ident, $count:literal $(, $arg:ident : $idx:tt)*) => {
        struct $structname<F, R, $($arg),*> {
            callable: F,
            marker: std::marker::PhantomData<fn($($arg),*) -> R>,
        }

        impl<F, R, $($arg),*> ServiceProcedure for $structname<F, R, $($arg),*>
        where
            F: Fn($($arg),*) -> Result<R, RemoteError>,
            R: ToSi,
            $($arg: FromSi,)*
        {
            fn arity(&self) -> usize {
                $count
            }

            fn invoke(&self, args: &[SerializationInfo]) -> Result<SerializationInfo, RemoteError> {
                if args.len() != $count {
                    return Err(RemoteError::invalid_params(format!(
                        "expected {} arguments, got {}",
                        $count,
                        args.len()
                    )));
                }
                let result = (self.callable)(
                    $($arg::from_si(&args[$idx])
                        .map_err(|e| RemoteError::invalid_params(e.to_string()))?),*
                )?;
                Ok(to_si(&result))
            }
        }

        impl Service {
            /// Registers a typed callable under `name`.
            pub fn $regname<F, R, $($arg),*>(
                &mut self,
                name: impl Into<String>,
                callable: F,
            ) -> Result<(), RpcError>
            where
                F: Fn($($arg),*) -> Result<R, RemoteError> + 'static,
                R: ToSi + 'static,
                $($arg: FromSi + 'static,)*
            {
                self.register_procedure(
                    name,
                    Rc::new($structname { callable, marker: std::marker::PhantomData }),
                )
            }
        }
    };
}

procedure_arity!(register_fn0, Procedure0, 0);
procedure_arity!(register_fn1, Procedure1, 1, A0: 0);
procedure_arity!(register_fn2, Procedure2, 2, A0: 0, A1: 1);
procedure_arity!(register_fn3, Procedure3, 3, A0: 0, A1: 1, A2: 2);
procedure_arity!(register_fn4, Procedure4, 4, A0: 0, A1: 1, A2: 2, A3: 3);

/// Resolves and invokes in one step, mapping a missing procedure to the
/// protocol-level error.
pub fn dispatch(
    service: &Service,
    method: &str,
    args: &[SerializationInfo],
) -> Result<SerializationInfo, RemoteError> {
    match service.resolve(method) {
        Some(procedure) => procedure.invoke(args),
        None => Err(RemoteError::method_not_found(method)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn service() -> Service {
        let mut svc = Service::new();
        svc.register_fn1("echo", |s: String| Ok(s)).unwrap();
        svc.register_fn2("add", |a: i64, b: i64| Ok(a + b)).unwrap();
        svc.register_fn0("pi", || Ok(std::f64::consts::PI)).unwrap();
        svc.register_fn1("checked_div", |pair: Vec<i64>| {
            if pair.len() != 2 {
                return Err(RemoteError::invalid_params("need two values"));
            }
            if pair[1] == 0 {
                return Err(RemoteError::remote(1, "division by zero"));
            }
            Ok(pair[0] / pair[1])
        })
        .unwrap();
        svc
    }

    #[test]
    fn registration_rejects_duplicates() {
        let mut svc = service();
        let err = svc.register_fn1("echo", |s: String| Ok(s)).unwrap_err();
        assert!(matches!(err, RpcError::DuplicateProcedure(name) if name == "echo"));
    }

    #[test]
    fn invoke_echo() {
        let svc = service();
        let args = [to_si("hello")];
        let result = dispatch(&svc, "echo", &args).unwrap();
        assert_eq!(result.as_str(), "hello");
    }

    #[test]
    fn invoke_add() {
        let svc = service();
        let args = [to_si(&5i64), to_si(&6i64)];
        assert_eq!(dispatch(&svc, "add", &args).unwrap().as_i64().unwrap(), 11);
    }

    #[test]
    fn missing_method() {
        let svc = service();
        let err = dispatch(&svc, "nope", &[]).unwrap_err();
        assert_eq!(err.code, crate::METHOD_NOT_FOUND);
    }

    #[test]
    fn wrong_arity_is_invalid_params() {
        let svc = service();
        let err = dispatch(&svc, "add", &[to_si(&1i64)]).unwrap_err();
        assert_eq!(err.code, crate::INVALID_PARAMS);
        assert_eq!(err.kind, ErrorKind::Serialization);
    }

    #[test]
    fn bad_argument_type_is_invalid_params() {
        let svc = service();
        let args = [to_si("not a number"), to_si(&1i64)];
        let err = dispatch(&svc, "add", &args).unwrap_err();
        assert_eq!(err.code, crate::INVALID_PARAMS);
    }

    #[test]
    fn application_error_passes_through() {
        let svc = service();
        let args = [to_si(&vec![1i64, 0])];
        let err = dispatch(&svc, "checked_div", &args).unwrap_err();
        assert_eq!(err.code, 1);
        assert_eq!(err.kind, ErrorKind::Remote);
    }
}
