use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::dict::Dict;
use crate::value::Value;

// A module: the result of a successful load, a named, insertion-
// ordered set of top-level bindings. The load hook freezes modules
// before handing them out so they can be shared between evaluations.
#[derive(Debug)]
pub struct Module {
    name: String,
    bindings: Rc<Dict>,
}

impl Module {
    pub fn new(name: &str) -> Module {
        Module {
            name: name.to_string(),
            bindings: Rc::new(Dict::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn define(&self, name: &str, value: Value) -> crate::error::Result<()> {
        self.bindings.insert(Value::string(name), value)?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.bindings.get(&Value::string(name)).ok().flatten()
    }

    pub fn bindings(&self) -> Vec<(Value, Value)> {
        self.bindings.items()
    }

    pub fn freeze(&self) {
        self.bindings.freeze();
    }
}

// Datastructure to manage lexical scoping of host globals.
pub struct Env {
    scope: RefCell<HashMap<String, Value>>,
    parent: Option<Rc<Env>>,
}

impl Env {
    fn new(parent: Option<Rc<Env>>) -> Env {
        let scope = RefCell::new(HashMap::new());
        Env { scope, parent }
    }

    pub fn root() -> Env {
        Self::new(None)
    }

    pub fn chain(parent: &Rc<Env>) -> Env {
        Self::new(Some(parent.clone()))
    }

    // Look up an identifier from anywhere in our scope chain.
    pub fn get(&self, key: &str) -> Option<Value> {
        if let Some(value) = self.scope.borrow().get(key) {
            Some(value.clone())
        } else if let Some(env) = &self.parent {
            env.get(key)
        } else {
            None
        }
    }

    // Insert a value in the current scope.
    pub fn define(&self, key: &str, value: Value) {
        self.scope.borrow_mut().insert(key.to_string(), value);
    }

    // Import the bindings of a loaded module into the current scope.
    pub fn import(&self, module: &Module) {
        for (k, v) in module.bindings() {
            if let Value::Str(name) = k {
                self.define(&name, v);
            }
        }
    }
}
