//! The opcode interpreter
//!
//! `run_until` executes the bytecode of the topmost frame (and everything
//! it calls) until the frame stack shrinks back to `base`, then returns
//! the final result. Every opcode completes before the next begins; the
//! collector only runs inside allocation points, when every live value is
//! rooted on the stack or in a frame.
//!
//! GC discipline for handlers that allocate: the operands stay on the
//! stack until after the allocation, and freshly-allocated containers are
//! pushed before they are filled, so nothing reachable is ever held only
//! in a Rust local across an allocation.

use swiftlang_core::{
    Closure, Handle, HeapData, Object, OpCode, ProtoKind, StrId, StructInstance, Value,
};

use crate::error::{ErrorKind, RuntimeError};
use crate::vm::{StructDef, Vm};

/// Two's-complement 32-bit truncation for the bitwise family: truncate
/// toward zero, then reduce modulo 2^32. Non-finite operands become 0.
fn to_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    let t = n.trunc();
    let m = t % 4_294_967_296.0;
    let m = if m < 0.0 { m + 4_294_967_296.0 } else { m };
    m as u32 as i32
}

impl Vm {
    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("dispatch without a frame");
        let byte = frame.chunk.byte_at(frame.ip).unwrap_or(OpCode::Halt as u8);
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte() as u16;
        let lo = self.read_byte() as u16;
        (hi << 8) | lo
    }

    fn read_op(&mut self) -> Result<OpCode, RuntimeError> {
        let byte = self.read_byte();
        OpCode::from_byte(byte).ok_or_else(|| {
            self.error(ErrorKind::Type, format!("illegal opcode {}", byte))
        })
    }

    fn constant(&self, index: u16) -> Result<Value, RuntimeError> {
        let frame = self.frames.last().expect("dispatch without a frame");
        frame
            .chunk
            .constants()
            .get(index as usize)
            .copied()
            .ok_or_else(|| self.error(ErrorKind::Type, "invalid constant index"))
    }

    fn name_constant(&self, index: u16) -> Result<StrId, RuntimeError> {
        match self.constant(index)? {
            Value::Str(id) => Ok(id),
            other => Err(self.error(
                ErrorKind::Type,
                format!("property name must be a string, got {}", self.describe(other)),
            )),
        }
    }

    /// Value-copy semantics for structs, applied at assignment sites.
    /// Everything else assigns by value already (handles share identity).
    fn assigned(&mut self, value: Value) -> Result<Value, RuntimeError> {
        match value {
            Value::Struct(handle) => Ok(Value::Struct(self.copy_struct(handle)?)),
            other => Ok(other),
        }
    }

    fn copy_struct(&mut self, handle: Handle) -> Result<Handle, RuntimeError> {
        let data = self
            .heap
            .struct_instance(handle)
            .cloned()
            .ok_or_else(|| self.error(ErrorKind::Type, "not a struct instance"))?;
        self.alloc(HeapData::Struct(data))
    }

    fn get_or_create_struct_proto(&mut self, name: StrId) -> Result<Handle, RuntimeError> {
        if let Some(def) = self.struct_defs.get(&name) {
            return Ok(def.proto);
        }
        let mut proto = Object::new();
        proto.set_prototype(Some(self.protos.object));
        proto.set_property(self.known.struct_type, Value::Str(name));
        let handle = self.alloc(HeapData::Object(proto))?;
        self.struct_defs.insert(
            name,
            StructDef {
                name,
                fields: Vec::new(),
                proto: handle,
            },
        );
        Ok(handle)
    }

    /// Method resolution: own properties first, then the prototype chain;
    /// string and number receivers search their built-in prototypes.
    fn method_lookup(&self, receiver: Value, name: StrId) -> Result<Value, RuntimeError> {
        let found = match receiver {
            Value::Object(handle) => swiftlang_core::object::get_property(&self.heap, handle, name),
            Value::Str(_) => {
                swiftlang_core::object::get_property(&self.heap, self.protos.string, name)
            }
            Value::Number(_) => {
                swiftlang_core::object::get_property(&self.heap, self.protos.number, name)
            }
            Value::Function(_) | Value::Closure(_) | Value::Native(_) => {
                swiftlang_core::object::get_property(&self.heap, self.protos.function, name)
            }
            Value::Struct(handle) => self
                .struct_field(handle, name)
                .or_else(|| {
                    self.heap.struct_instance(handle).and_then(|instance| {
                        let proto = self.struct_defs.get(&instance.type_name)?.proto;
                        swiftlang_core::object::get_property(&self.heap, proto, name)
                    })
                }),
            Value::Nil | Value::Bool(_) => None,
        };
        found.ok_or_else(|| {
            self.error(
                ErrorKind::Type,
                format!(
                    "unknown method '{}' on {}",
                    self.strings.resolve(name),
                    self.describe(receiver)
                ),
            )
        })
    }

    fn struct_field(&self, handle: Handle, name: StrId) -> Option<Value> {
        let instance = self.heap.struct_instance(handle)?;
        let def = self.struct_defs.get(&instance.type_name)?;
        let position = def.fields.iter().position(|f| *f == name)?;
        instance.fields.get(position).copied()
    }

    fn struct_field_position(&self, handle: Handle, name: StrId) -> Result<usize, RuntimeError> {
        let instance = self
            .heap
            .struct_instance(handle)
            .ok_or_else(|| self.error(ErrorKind::Type, "not a struct instance"))?;
        let def = self
            .struct_defs
            .get(&instance.type_name)
            .ok_or_else(|| self.error(ErrorKind::Type, "unknown struct type"))?;
        def.fields.iter().position(|f| *f == name).ok_or_else(|| {
            self.error(
                ErrorKind::Type,
                format!(
                    "struct {} has no field '{}'",
                    self.strings.resolve(instance.type_name),
                    self.strings.resolve(name)
                ),
            )
        })
    }

    /// Execute until the frame stack returns to `base` frames. The result
    /// of the last returning frame is left pushed on the stack and also
    /// returned.
    pub(crate) fn run_until(&mut self, base: usize) -> Result<Value, RuntimeError> {
        loop {
            if self.trace_execution {
                self.trace_instruction();
            }
            let op = self.read_op()?;
            match op {
                OpCode::Constant => {
                    let index = self.read_byte() as u16;
                    let value = self.constant(index)?;
                    self.push(value);
                }
                OpCode::ConstantLong => {
                    let index = self.read_u16();
                    let value = self.constant(index)?;
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::Dup => {
                    let top = self.peek(0);
                    self.push(top);
                }
                OpCode::Swap => {
                    let len = self.stack.len();
                    if len >= 2 {
                        self.stack.swap(len - 1, len - 2);
                    }
                }

                OpCode::Add => {
                    let b = self.pop();
                    let a = self.pop();
                    match (a, b) {
                        (Value::Number(x), Value::Number(y)) => self.push(Value::Number(x + y)),
                        (Value::Str(x), Value::Str(y)) => {
                            let joined =
                                format!("{}{}", self.strings.resolve(x), self.strings.resolve(y));
                            let id = self.strings.intern(&joined);
                            self.push(Value::Str(id));
                        }
                        (a, b) => {
                            return Err(self.error(
                                ErrorKind::Type,
                                format!(
                                    "operands must be two numbers or two strings, got {} and {}",
                                    self.describe(a),
                                    self.describe(b)
                                ),
                            ));
                        }
                    }
                }
                OpCode::Subtract => self.binary_number(op, |a, b| a - b)?,
                OpCode::Multiply => self.binary_number(op, |a, b| a * b)?,
                OpCode::Divide => {
                    self.check_zero_divisor("division by zero")?;
                    self.binary_number(op, |a, b| a / b)?;
                }
                OpCode::Modulo => {
                    self.check_zero_divisor("modulo by zero")?;
                    self.binary_number(op, |a, b| a % b)?;
                }
                OpCode::Power => self.binary_number(op, f64::powf)?,
                OpCode::Negate => {
                    let value = self.pop();
                    match value {
                        Value::Number(n) => self.push(Value::Number(-n)),
                        other => {
                            return Err(self.error(
                                ErrorKind::Type,
                                format!("operand must be a number, got {}", self.describe(other)),
                            ));
                        }
                    }
                }

                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::NotEqual => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a != b));
                }
                OpCode::Greater => self.binary_compare(|a, b| a > b)?,
                OpCode::GreaterEqual => self.binary_compare(|a, b| a >= b)?,
                OpCode::Less => self.binary_compare(|a, b| a < b)?,
                OpCode::LessEqual => self.binary_compare(|a, b| a <= b)?,

                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::And => {
                    // Pushes the operand that decided the result, not a bool.
                    let b = self.pop();
                    let a = self.pop();
                    self.push(if a.is_falsey() { a } else { b });
                }
                OpCode::Or => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(if a.is_truthy() { a } else { b });
                }

                OpCode::BitAnd => self.binary_int32(|a, b| a & b)?,
                OpCode::BitOr => self.binary_int32(|a, b| a | b)?,
                OpCode::BitXor => self.binary_int32(|a, b| a ^ b)?,
                OpCode::ShiftLeft => self.binary_int32(|a, b| a << (b & 31))?,
                OpCode::ShiftRight => self.binary_int32(|a, b| a >> (b & 31))?,
                OpCode::BitNot => {
                    let value = self.pop();
                    match value {
                        Value::Number(n) => self.push(Value::Number(!to_int32(n) as f64)),
                        other => {
                            return Err(self.error(
                                ErrorKind::Type,
                                format!("operand must be a number, got {}", self.describe(other)),
                            ));
                        }
                    }
                }

                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let frame_slots = self.frames.last().expect("frame").slots;
                    let value = self.stack.get(frame_slots + slot).copied().unwrap_or(Value::Nil);
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let value = self.assigned(self.peek(0))?;
                    self.set_peek(0, value);
                    let frame_slots = self.frames.last().expect("frame").slots;
                    if let Some(cell) = self.stack.get_mut(frame_slots + slot) {
                        *cell = value;
                    }
                }
                OpCode::GetGlobal => {
                    let index = self.read_byte() as u16;
                    let name = self.name_constant(index)?;
                    let value = self
                        .current_module
                        .and_then(|id| self.modules.get(id))
                        .and_then(|m| m.globals.get(&name).copied())
                        .or_else(|| self.globals.get(&name).copied());
                    match value {
                        Some(value) => self.push(value),
                        None => {
                            return Err(self.error(
                                ErrorKind::UndefinedBinding,
                                format!("undefined global '{}'", self.strings.resolve(name)),
                            ));
                        }
                    }
                }
                OpCode::SetGlobal => {
                    let index = self.read_byte() as u16;
                    let name = self.name_constant(index)?;
                    let value = self.assigned(self.peek(0))?;
                    self.set_peek(0, value);
                    let in_module = self
                        .current_module
                        .and_then(|id| self.modules.get(id))
                        .map(|m| m.globals.contains_key(&name))
                        .unwrap_or(false);
                    if in_module {
                        if let Some(module) =
                            self.current_module.and_then(|id| self.modules.get_mut(id))
                        {
                            module.globals.insert(name, value);
                        }
                    } else {
                        // Assignment to an unknown global falls through to a
                        // define in the VM globals.
                        self.globals.insert(name, value);
                    }
                }
                OpCode::DefineGlobal => {
                    let index = self.read_byte() as u16;
                    let name = self.name_constant(index)?;
                    let value = self.assigned(self.peek(0))?;
                    match self.current_module.and_then(|id| self.modules.get_mut(id)) {
                        Some(module) => {
                            module.globals.insert(name, value);
                        }
                        None => {
                            self.globals.insert(name, value);
                        }
                    }
                    self.pop();
                }
                OpCode::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let closure = self.frames.last().expect("frame").closure;
                    let cell = self
                        .heap
                        .closure(closure)
                        .and_then(|c| c.upvalues.get(index).copied());
                    let Some(cell) = cell else {
                        return Err(
                            self.error(ErrorKind::UndefinedBinding, "unbound upvalue slot")
                        );
                    };
                    let value = match self.heap.upvalue(cell) {
                        Some(swiftlang_core::Upvalue::Open(slot)) => {
                            self.stack.get(*slot).copied().unwrap_or(Value::Nil)
                        }
                        Some(swiftlang_core::Upvalue::Closed(value)) => *value,
                        None => {
                            return Err(
                                self.error(ErrorKind::UndefinedBinding, "unbound upvalue slot")
                            );
                        }
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let value = self.assigned(self.peek(0))?;
                    self.set_peek(0, value);
                    let closure = self.frames.last().expect("frame").closure;
                    let cell = self
                        .heap
                        .closure(closure)
                        .and_then(|c| c.upvalues.get(index).copied());
                    let Some(cell) = cell else {
                        return Err(
                            self.error(ErrorKind::UndefinedBinding, "unbound upvalue slot")
                        );
                    };
                    match self.heap.upvalue(cell).copied() {
                        Some(swiftlang_core::Upvalue::Open(slot)) => {
                            if let Some(target) = self.stack.get_mut(slot) {
                                *target = value;
                            }
                        }
                        Some(swiftlang_core::Upvalue::Closed(_)) => {
                            if let Some(cell) = self.heap.upvalue_mut(cell) {
                                *cell = swiftlang_core::Upvalue::Closed(value);
                            }
                        }
                        None => {
                            return Err(
                                self.error(ErrorKind::UndefinedBinding, "unbound upvalue slot")
                            );
                        }
                    }
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len().saturating_sub(1);
                    self.close_upvalues(top);
                    self.pop();
                }

                OpCode::Jump => {
                    let distance = self.read_u16() as usize;
                    self.frames.last_mut().expect("frame").ip += distance;
                }
                OpCode::JumpIfFalse => {
                    let distance = self.read_u16() as usize;
                    if self.peek(0).is_falsey() {
                        self.frames.last_mut().expect("frame").ip += distance;
                    }
                }
                OpCode::JumpIfTrue => {
                    let distance = self.read_u16() as usize;
                    if self.peek(0).is_truthy() {
                        self.frames.last_mut().expect("frame").ip += distance;
                    }
                }
                OpCode::Loop => {
                    let distance = self.read_u16() as usize;
                    self.frames.last_mut().expect("frame").ip -= distance;
                }

                OpCode::Call => {
                    let arg_count = self.read_byte();
                    let callee = self.peek(arg_count as usize);
                    self.call_value(callee, arg_count, 0)?;
                }
                OpCode::MethodCall => {
                    let arg_count = self.read_byte();
                    let index = self.read_byte() as u16;
                    let name = self.name_constant(index)?;
                    let receiver = self.peek(arg_count as usize);
                    let method = self.method_lookup(receiver, name)?;
                    // The receiver stays in the callee slot: closures see it
                    // as slot 0, natives as argv[0].
                    self.call_value(method, arg_count, 1)?;
                }
                OpCode::Return => {
                    let result = self.pop();
                    self.pop_frame(result);
                    if self.frames.len() == base {
                        return Ok(result);
                    }
                }
                OpCode::Closure => {
                    let index = self.read_byte() as u16;
                    self.make_closure(index)?;
                }
                OpCode::ClosureLong => {
                    let index = self.read_u16();
                    self.make_closure(index)?;
                }

                OpCode::CreateObject => {
                    let mut object = Object::new();
                    object.set_prototype(Some(self.protos.object));
                    let handle = self.alloc(HeapData::Object(object))?;
                    self.push(Value::Object(handle));
                }
                OpCode::ObjectLiteral => {
                    let count = self.read_byte() as usize;
                    self.build_object_literal(count)?;
                }
                OpCode::BuildArray => {
                    let count = self.read_byte() as usize;
                    self.build_array(count)?;
                }
                OpCode::GetSubscript => {
                    let index = self.pop();
                    let receiver = self.pop();
                    let value = self.get_subscript(receiver, index)?;
                    self.push(value);
                }
                OpCode::SetSubscript => {
                    self.set_subscript()?;
                }
                OpCode::Length => {
                    let value = self.pop();
                    let length = self.length_of(value)?;
                    self.push(length);
                }

                OpCode::GetProperty => {
                    let index = self.read_byte() as u16;
                    let name = self.name_constant(index)?;
                    let receiver = self.pop();
                    let value = self.get_property_value(receiver, name)?;
                    self.push(value);
                }
                OpCode::SetProperty => {
                    let index = self.read_byte() as u16;
                    let name = self.name_constant(index)?;
                    self.set_property_value(name)?;
                }
                OpCode::GetField => {
                    let index = self.read_byte() as u16;
                    let name = self.name_constant(index)?;
                    let receiver = self.pop();
                    let Value::Struct(handle) = receiver else {
                        return Err(self.error(
                            ErrorKind::Type,
                            format!("fields require a struct, got {}", self.describe(receiver)),
                        ));
                    };
                    let position = self.struct_field_position(handle, name)?;
                    let value = self
                        .heap
                        .struct_instance(handle)
                        .and_then(|i| i.fields.get(position).copied())
                        .unwrap_or(Value::Nil);
                    self.push(value);
                }
                OpCode::SetField => {
                    let index = self.read_byte() as u16;
                    let name = self.name_constant(index)?;
                    let value = self.assigned(self.peek(0))?;
                    self.set_peek(0, value);
                    let receiver = self.peek(1);
                    let Value::Struct(handle) = receiver else {
                        return Err(self.error(
                            ErrorKind::Type,
                            format!("fields require a struct, got {}", self.describe(receiver)),
                        ));
                    };
                    let position = self.struct_field_position(handle, name)?;
                    if let Some(instance) = self.heap.struct_instance_mut(handle) {
                        instance.fields[position] = value;
                    }
                    self.gc.write_barrier(&mut self.heap, handle, value);
                    self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::DefineStruct => {
                    let index = self.read_byte() as u16;
                    let name = self.name_constant(index)?;
                    let field_count = self.read_byte() as usize;
                    let mut fields = Vec::with_capacity(field_count);
                    for _ in 0..field_count {
                        let index = self.read_byte() as u16;
                        fields.push(self.name_constant(index)?);
                    }
                    let proto = self.get_or_create_struct_proto(name)?;
                    self.struct_defs.insert(
                        name,
                        StructDef {
                            name,
                            fields,
                            proto,
                        },
                    );
                }
                OpCode::CreateStruct => {
                    let index = self.read_byte() as u16;
                    let name = self.name_constant(index)?;
                    self.create_struct(name)?;
                }

                OpCode::GetObjectProto => {
                    let kind = self.read_byte();
                    let Some(kind) = ProtoKind::from_byte(kind) else {
                        return Err(self.error(ErrorKind::Type, "unknown prototype selector"));
                    };
                    let handle = match kind {
                        ProtoKind::Object => self.protos.object,
                        ProtoKind::Array => self.protos.array,
                        ProtoKind::String => self.protos.string,
                        ProtoKind::Number => self.protos.number,
                        ProtoKind::Function => self.protos.function,
                    };
                    self.push(Value::Object(handle));
                }
                OpCode::GetStructProto => {
                    let index = self.read_byte() as u16;
                    let name = self.name_constant(index)?;
                    let handle = self.get_or_create_struct_proto(name)?;
                    self.push(Value::Object(handle));
                }

                OpCode::LoadModule => {
                    let index = self.read_byte() as u16;
                    let name = self.name_constant(index)?;
                    let path = self.strings.resolve(name).to_string();
                    let loader = std::sync::Arc::clone(&self.loader);
                    let module_id = loader
                        .load(self, &path)
                        .map_err(|e| self.error(ErrorKind::Module, e.to_string()))?;
                    let object = self
                        .modules
                        .get(module_id)
                        .map(|m| m.object)
                        .expect("loader returned unknown module");
                    self.push(Value::Object(object));
                }
                OpCode::ImportFrom => {
                    let index = self.read_byte() as u16;
                    let name = self.name_constant(index)?;
                    let top = self.peek(0);
                    let Value::Object(module_object) = top else {
                        return Err(self.error(
                            ErrorKind::Type,
                            format!("import requires a module object, got {}", self.describe(top)),
                        ));
                    };
                    let value = self
                        .heap
                        .object(module_object)
                        .and_then(|o| o.get_own_property(name));
                    let Some(value) = value else {
                        return Err(self.error(
                            ErrorKind::UndefinedBinding,
                            format!("module has no export '{}'", self.strings.resolve(name)),
                        ));
                    };
                    self.set_peek(0, value);
                }
                OpCode::ModuleExport => {
                    let index = self.read_byte() as u16;
                    let name = self.name_constant(index)?;
                    let value = self.peek(0);
                    let Some(module_id) = self.current_module else {
                        return Err(
                            self.error(ErrorKind::Module, "export outside of a module")
                        );
                    };
                    let object = {
                        let module = self
                            .modules
                            .get_mut(module_id)
                            .expect("current module missing from registry");
                        module.define(name, value, true);
                        module.object
                    };
                    if let Some(obj) = self.heap.object_mut(object) {
                        obj.set_property(name, value);
                    }
                    self.gc.write_barrier(&mut self.heap, object, value);
                    self.heap.refresh_size(object);
                }

                OpCode::ToString => {
                    let value = self.pop();
                    let text = self.to_display_string(value);
                    let id = self.strings.intern(&text);
                    self.push(Value::Str(id));
                }
                OpCode::StringConcat => {
                    let b = self.pop();
                    let a = self.pop();
                    let joined = format!(
                        "{}{}",
                        self.to_display_string(a),
                        self.to_display_string(b)
                    );
                    let id = self.strings.intern(&joined);
                    self.push(Value::Str(id));
                }
                OpCode::StringInterp => {
                    let count = self.read_byte() as usize;
                    let start = self.stack.len().saturating_sub(count);
                    let mut joined = String::new();
                    for i in start..self.stack.len() {
                        let part = self.stack[i];
                        joined.push_str(&self.to_display_string(part));
                    }
                    let id = self.strings.intern(&joined);
                    self.stack.truncate(start);
                    self.push(Value::Str(id));
                }
                OpCode::InternString => {
                    // String values are interned by construction; anything
                    // else here is a front-end bug.
                    let top = self.peek(0);
                    if !matches!(top, Value::Str(_)) {
                        return Err(self.error(
                            ErrorKind::Type,
                            format!("cannot intern {}", self.describe(top)),
                        ));
                    }
                }

                OpCode::Await => {
                    return Err(self.error(ErrorKind::Type, "await is not supported"));
                }
                OpCode::Halt => {
                    self.pop_frame(Value::Nil);
                    if self.frames.len() == base {
                        return Ok(Value::Nil);
                    }
                }
            }
        }
    }

    fn binary_number(
        &mut self,
        op: OpCode,
        f: impl FnOnce(f64, f64) -> f64,
    ) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                self.push(Value::Number(f(x, y)));
                Ok(())
            }
            (a, b) => Err(self.error(
                ErrorKind::Type,
                format!(
                    "{} requires two numbers, got {} and {}",
                    op.name(),
                    self.describe(a),
                    self.describe(b)
                ),
            )),
        }
    }

    fn binary_compare(&mut self, f: impl FnOnce(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                self.push(Value::Bool(f(x, y)));
                Ok(())
            }
            (a, b) => Err(self.error(
                ErrorKind::Type,
                format!(
                    "ordering requires two numbers, got {} and {}",
                    self.describe(a),
                    self.describe(b)
                ),
            )),
        }
    }

    fn binary_int32(&mut self, f: impl FnOnce(i32, i32) -> i32) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                self.push(Value::Number(f(to_int32(x), to_int32(y)) as f64));
                Ok(())
            }
            (a, b) => Err(self.error(
                ErrorKind::Type,
                format!(
                    "bitwise operation requires two numbers, got {} and {}",
                    self.describe(a),
                    self.describe(b)
                ),
            )),
        }
    }

    fn check_zero_divisor(&self, message: &str) -> Result<(), RuntimeError> {
        if let Value::Number(divisor) = self.peek(0)
            && divisor == 0.0
        {
            return Err(self.error(ErrorKind::Arithmetic, message));
        }
        Ok(())
    }

    fn make_closure(&mut self, index: u16) -> Result<(), RuntimeError> {
        let function_value = self.constant(index)?;
        let Value::Function(function) = function_value else {
            return Err(self.error(ErrorKind::Type, "closure constant is not a function"));
        };
        let upvalue_count = self
            .heap
            .function(function)
            .map(|f| f.upvalue_count)
            .ok_or_else(|| self.error(ErrorKind::Type, "closure constant is not a function"))?;

        let frame_slots = self.frames.last().expect("frame").slots;
        let enclosing = self.frames.last().expect("frame").closure;
        let mut upvalues = Vec::with_capacity(upvalue_count as usize);
        for _ in 0..upvalue_count {
            let is_local = self.read_byte() != 0;
            let slot_index = self.read_byte() as usize;
            if is_local {
                // Cells in the open list are rooted there while we collect
                // the rest.
                let cell = self.capture_upvalue(frame_slots + slot_index)?;
                upvalues.push(cell);
            } else {
                let cell = self
                    .heap
                    .closure(enclosing)
                    .and_then(|c| c.upvalues.get(slot_index).copied())
                    .ok_or_else(|| {
                        self.error(ErrorKind::UndefinedBinding, "unbound upvalue slot")
                    })?;
                upvalues.push(cell);
            }
        }
        let closure = self.alloc(HeapData::Closure(Closure::new(function, upvalues)))?;
        self.push(Value::Closure(closure));
        Ok(())
    }

    fn build_object_literal(&mut self, count: usize) -> Result<(), RuntimeError> {
        let mut object = Object::new();
        object.set_prototype(Some(self.protos.object));
        // Operands stay on the stack across the allocation.
        let handle = self.alloc(HeapData::Object(object))?;
        self.push(Value::Object(handle));

        let base = self.stack.len() - 1 - count * 2;
        for i in 0..count {
            let key = self.stack[base + i * 2];
            let Value::Str(key) = key else {
                return Err(self.error(
                    ErrorKind::Type,
                    format!("property name must be a string, got {}", self.describe(key)),
                ));
            };
            let value = self.assigned(self.stack[base + i * 2 + 1])?;
            if let Some(object) = self.heap.object_mut(handle) {
                object.set_property(key, value);
            }
            self.gc.write_barrier(&mut self.heap, handle, value);
        }
        self.heap.refresh_size(handle);
        self.stack.truncate(base);
        self.push(Value::Object(handle));
        Ok(())
    }

    fn build_array(&mut self, count: usize) -> Result<(), RuntimeError> {
        let mut array = Object::array();
        array.set_prototype(Some(self.protos.array));
        let handle = self.alloc(HeapData::Object(array))?;
        self.push(Value::Object(handle));

        let base = self.stack.len() - 1 - count;
        for i in 0..count {
            let value = self.assigned(self.stack[base + i])?;
            let key = swiftlang_core::object::array_index_key(&mut self.strings, i);
            if let Some(array) = self.heap.object_mut(handle) {
                array.set_property(key, value);
            }
            self.gc.write_barrier(&mut self.heap, handle, value);
        }
        let length_key = self.known.length;
        if let Some(array) = self.heap.object_mut(handle) {
            array.set_property(length_key, Value::Number(count as f64));
        }
        self.heap.refresh_size(handle);
        self.stack.truncate(base);
        self.push(Value::Object(handle));
        Ok(())
    }

    fn create_struct(&mut self, name: StrId) -> Result<(), RuntimeError> {
        let def = self.struct_defs.get(&name).ok_or_else(|| {
            self.error(
                ErrorKind::Type,
                format!("unknown struct '{}'", self.strings.resolve(name)),
            )
        })?;
        let count = def.fields.len();
        if self.stack.len() < count {
            return Err(self.error(ErrorKind::Type, "missing struct field values"));
        }
        let base = self.stack.len() - count;
        let fields: Vec<Value> = self.stack[base..].to_vec();
        // Field values are still on the stack, so the fresh instance's
        // referents are rooted across this allocation.
        let handle = self.alloc(HeapData::Struct(StructInstance::new(name, fields)))?;
        self.push(Value::Struct(handle));
        // Nested struct fields get their own copies now that the instance
        // itself is rooted on the stack.
        for position in 0..count {
            let field = self.stack[base + position];
            if let Value::Struct(_) = field {
                let copy = self.assigned(field)?;
                if let Some(instance) = self.heap.struct_instance_mut(handle) {
                    instance.fields[position] = copy;
                }
                self.gc.write_barrier(&mut self.heap, handle, copy);
            }
        }
        let result = self.pop();
        self.stack.truncate(base);
        self.push(result);
        Ok(())
    }

    fn get_subscript(&mut self, receiver: Value, index: Value) -> Result<Value, RuntimeError> {
        match (receiver, index) {
            (Value::Str(id), Value::Number(n)) => {
                let text = self.strings.resolve(id);
                let position = n as i64;
                if position < 0 || n.fract() != 0.0 {
                    return Err(self.error(ErrorKind::Bounds, "string index out of range"));
                }
                let ch = text.chars().nth(position as usize);
                match ch {
                    Some(ch) => {
                        let s = ch.to_string();
                        let id = self.strings.intern(&s);
                        Ok(Value::Str(id))
                    }
                    None => Err(self.error(ErrorKind::Bounds, "string index out of range")),
                }
            }
            (Value::Str(_), other) => Err(self.error(
                ErrorKind::Type,
                format!("string index must be a number, got {}", self.describe(other)),
            )),
            (Value::Object(handle), Value::Number(n)) => {
                if n < 0.0 || n.fract() != 0.0 {
                    return Ok(Value::Nil);
                }
                let key = swiftlang_core::object::array_index_key(&mut self.strings, n as usize);
                Ok(self
                    .heap
                    .object(handle)
                    .and_then(|o| o.get_own_property(key))
                    .unwrap_or(Value::Nil))
            }
            (Value::Object(handle), Value::Str(key)) => Ok(swiftlang_core::object::get_property(
                &self.heap, handle, key,
            )
            .unwrap_or(Value::Nil)),
            (Value::Struct(handle), Value::Str(key)) => {
                Ok(self.struct_field(handle, key).unwrap_or(Value::Nil))
            }
            (receiver, _) => Err(self.error(
                ErrorKind::Type,
                format!("cannot subscript {}", self.describe(receiver)),
            )),
        }
    }

    fn set_subscript(&mut self) -> Result<(), RuntimeError> {
        let value = self.assigned(self.peek(0))?;
        self.set_peek(0, value);
        let index = self.peek(1);
        let receiver = self.peek(2);
        match (receiver, index) {
            (Value::Object(handle), Value::Number(n)) => {
                if n < 0.0 || n.fract() != 0.0 {
                    return Err(self.error(
                        ErrorKind::Type,
                        "array index must be a nonnegative integer",
                    ));
                }
                let position = n as usize;
                let key = swiftlang_core::object::array_index_key(&mut self.strings, position);
                let length_key = self.known.length;
                let is_array = self.heap.object(handle).map(|o| o.is_array).unwrap_or(false);
                if let Some(object) = self.heap.object_mut(handle) {
                    object.set_property(key, value);
                }
                if is_array {
                    // Assignment past the end extends the array.
                    let length = self
                        .heap
                        .object(handle)
                        .and_then(|o| o.get_own_property(length_key))
                        .and_then(Value::as_number)
                        .unwrap_or(0.0);
                    if (position as f64) >= length
                        && let Some(object) = self.heap.object_mut(handle)
                    {
                        object.set_property(length_key, Value::Number(position as f64 + 1.0));
                    }
                }
                self.gc.write_barrier(&mut self.heap, handle, value);
                self.heap.refresh_size(handle);
            }
            (Value::Object(handle), Value::Str(key)) => {
                if let Some(object) = self.heap.object_mut(handle) {
                    object.set_property(key, value);
                }
                self.gc.write_barrier(&mut self.heap, handle, value);
                self.heap.refresh_size(handle);
            }
            (Value::Struct(handle), Value::Str(key)) => {
                let position = self.struct_field_position(handle, key)?;
                if let Some(instance) = self.heap.struct_instance_mut(handle) {
                    instance.fields[position] = value;
                }
                self.gc.write_barrier(&mut self.heap, handle, value);
            }
            (Value::Str(_), _) => {
                return Err(self.error(ErrorKind::Type, "strings are read-only"));
            }
            (receiver, _) => {
                return Err(self.error(
                    ErrorKind::Type,
                    format!("cannot subscript {}", self.describe(receiver)),
                ));
            }
        }
        // Replace [receiver, index, value] with the assigned value.
        self.pop();
        self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    fn length_of(&self, value: Value) -> Result<Value, RuntimeError> {
        match value {
            Value::Str(id) => Ok(Value::Number(self.strings.resolve(id).len() as f64)),
            Value::Object(handle) => {
                swiftlang_core::object::get_property(&self.heap, handle, self.known.length)
                    .ok_or_else(|| {
                        self.error(ErrorKind::Type, "object has no length property")
                    })
            }
            other => Err(self.error(
                ErrorKind::Type,
                format!("{} has no length", self.describe(other)),
            )),
        }
    }

    fn get_property_value(&mut self, receiver: Value, name: StrId) -> Result<Value, RuntimeError> {
        match receiver {
            Value::Object(handle) => Ok(swiftlang_core::object::get_property(
                &self.heap, handle, name,
            )
            .unwrap_or(Value::Nil)),
            Value::Struct(handle) => Ok(self
                .struct_field(handle, name)
                .or_else(|| {
                    self.heap.struct_instance(handle).and_then(|instance| {
                        let proto = self.struct_defs.get(&instance.type_name)?.proto;
                        swiftlang_core::object::get_property(&self.heap, proto, name)
                    })
                })
                .unwrap_or(Value::Nil)),
            Value::Str(_) => Ok(swiftlang_core::object::get_property(
                &self.heap,
                self.protos.string,
                name,
            )
            .unwrap_or(Value::Nil)),
            Value::Number(_) => Ok(swiftlang_core::object::get_property(
                &self.heap,
                self.protos.number,
                name,
            )
            .unwrap_or(Value::Nil)),
            Value::Function(_) | Value::Closure(_) | Value::Native(_) => {
                Ok(swiftlang_core::object::get_property(
                    &self.heap,
                    self.protos.function,
                    name,
                )
                .unwrap_or(Value::Nil))
            }
            other => Err(self.error(
                ErrorKind::Type,
                format!("cannot read property of {}", self.describe(other)),
            )),
        }
    }

    fn set_property_value(&mut self, name: StrId) -> Result<(), RuntimeError> {
        let value = self.assigned(self.peek(0))?;
        self.set_peek(0, value);
        let receiver = self.peek(1);
        match receiver {
            Value::Object(handle) => {
                if let Some(object) = self.heap.object_mut(handle) {
                    object.set_property(name, value);
                }
                self.gc.write_barrier(&mut self.heap, handle, value);
                self.heap.refresh_size(handle);
            }
            Value::Struct(handle) => {
                let position = self.struct_field_position(handle, name)?;
                if let Some(instance) = self.heap.struct_instance_mut(handle) {
                    instance.fields[position] = value;
                }
                self.gc.write_barrier(&mut self.heap, handle, value);
            }
            other => {
                return Err(self.error(
                    ErrorKind::Type,
                    format!("cannot set property on {}", self.describe(other)),
                ));
            }
        }
        self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swiftlang_core::{Chunk, Function};

    fn run(vm: &mut Vm, chunk: Chunk) -> Result<Value, RuntimeError> {
        let name = vm.strings.intern("<script>");
        let function = Function::new(name, 0, chunk);
        let handle = vm.alloc(HeapData::Function(function)).unwrap();
        vm.interpret(handle)
    }

    fn run_ok(vm: &mut Vm, chunk: Chunk) -> Value {
        run(vm, chunk).expect("chunk should run")
    }

    #[test]
    fn test_constants_and_arithmetic() {
        let mut vm = Vm::new();
        let mut chunk = Chunk::new();
        chunk.emit_constant(Value::Number(3.0), 1);
        chunk.emit_constant(Value::Number(4.0), 1);
        chunk.write_op(OpCode::Multiply, 1);
        chunk.emit_constant(Value::Number(2.0), 1);
        chunk.write_op(OpCode::Add, 1);
        chunk.write_op(OpCode::Return, 1);
        assert_eq!(run_ok(&mut vm, chunk), Value::Number(14.0));
    }

    #[test]
    fn test_string_addition_interns_result() {
        let mut vm = Vm::new();
        let fo = Value::Str(vm.strings.intern("fo"));
        let o = Value::Str(vm.strings.intern("o"));
        let mut chunk = Chunk::new();
        chunk.emit_constant(fo, 1);
        chunk.emit_constant(o, 1);
        chunk.write_op(OpCode::Add, 1);
        chunk.write_op(OpCode::Return, 1);
        let result = run_ok(&mut vm, chunk);
        assert_eq!(result, Value::Str(vm.strings.intern("foo")));
    }

    #[test]
    fn test_division_by_zero_is_arithmetic_error() {
        let mut vm = Vm::new();
        let mut chunk = Chunk::new();
        chunk.emit_constant(Value::Number(1.0), 1);
        chunk.emit_constant(Value::Number(0.0), 1);
        chunk.write_op(OpCode::Divide, 1);
        chunk.write_op(OpCode::Return, 1);
        let err = run(&mut vm, chunk).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Arithmetic);
    }

    #[test]
    fn test_modulo_by_zero_is_arithmetic_error() {
        let mut vm = Vm::new();
        let mut chunk = Chunk::new();
        chunk.emit_constant(Value::Number(5.0), 1);
        chunk.emit_constant(Value::Number(0.0), 1);
        chunk.write_op(OpCode::Modulo, 1);
        chunk.write_op(OpCode::Return, 1);
        let err = run(&mut vm, chunk).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Arithmetic);
    }

    #[test]
    fn test_comparison_on_non_numbers_is_type_error() {
        let mut vm = Vm::new();
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::True, 1);
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Greater, 1);
        chunk.write_op(OpCode::Return, 1);
        let err = run(&mut vm, chunk).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Type);
    }

    #[test]
    fn test_and_or_push_deciding_operand() {
        let mut vm = Vm::new();
        let mut chunk = Chunk::new();
        // nil and 2 -> nil
        chunk.write_op(OpCode::Nil, 1);
        chunk.emit_constant(Value::Number(2.0), 1);
        chunk.write_op(OpCode::And, 1);
        chunk.write_op(OpCode::Return, 1);
        assert_eq!(run_ok(&mut vm, chunk), Value::Nil);

        let mut chunk = Chunk::new();
        // 1 or 2 -> 1
        chunk.emit_constant(Value::Number(1.0), 1);
        chunk.emit_constant(Value::Number(2.0), 1);
        chunk.write_op(OpCode::Or, 1);
        chunk.write_op(OpCode::Return, 1);
        assert_eq!(run_ok(&mut vm, chunk), Value::Number(1.0));
    }

    #[test]
    fn test_bitwise_is_pinned_to_32_bits() {
        assert_eq!(to_int32(0.0), 0);
        assert_eq!(to_int32(-1.0), -1);
        assert_eq!(to_int32(4_294_967_296.0), 0);
        assert_eq!(to_int32(4_294_967_297.0), 1);
        assert_eq!(to_int32(2_147_483_648.0), -2_147_483_648);
        assert_eq!(to_int32(-2_147_483_649.0), 2_147_483_647);
        assert_eq!(to_int32(1.9), 1);
        assert_eq!(to_int32(-1.9), -1);
        assert_eq!(to_int32(f64::NAN), 0);
        assert_eq!(to_int32(f64::INFINITY), 0);

        let mut vm = Vm::new();
        let mut chunk = Chunk::new();
        chunk.emit_constant(Value::Number(6.0), 1);
        chunk.emit_constant(Value::Number(3.0), 1);
        chunk.write_op(OpCode::BitXor, 1);
        chunk.write_op(OpCode::Return, 1);
        assert_eq!(run_ok(&mut vm, chunk), Value::Number(5.0));

        let mut chunk = Chunk::new();
        chunk.emit_constant(Value::Number(1.0), 1);
        chunk.emit_constant(Value::Number(33.0), 1);
        chunk.write_op(OpCode::ShiftLeft, 1);
        chunk.write_op(OpCode::Return, 1);
        // Shift counts mask to 0..=31, so 1 << 33 == 1 << 1.
        assert_eq!(run_ok(&mut vm, chunk), Value::Number(2.0));
    }

    #[test]
    fn test_globals_define_get_set() {
        let mut vm = Vm::new();
        let name = Value::Str(vm.strings.intern("answer"));
        let mut chunk = Chunk::new();
        let name_idx = chunk.add_constant(name) as u8;
        chunk.emit_constant(Value::Number(42.0), 1);
        chunk.write_op(OpCode::DefineGlobal, 1);
        chunk.write_byte(name_idx, 1);
        chunk.write_op(OpCode::GetGlobal, 2);
        chunk.write_byte(name_idx, 2);
        chunk.write_op(OpCode::Return, 2);
        assert_eq!(run_ok(&mut vm, chunk), Value::Number(42.0));
    }

    #[test]
    fn test_get_unknown_global_is_undefined_binding() {
        let mut vm = Vm::new();
        let name = Value::Str(vm.strings.intern("ghost"));
        let mut chunk = Chunk::new();
        let name_idx = chunk.add_constant(name) as u8;
        chunk.write_op(OpCode::GetGlobal, 1);
        chunk.write_byte(name_idx, 1);
        chunk.write_op(OpCode::Return, 1);
        let err = run(&mut vm, chunk).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UndefinedBinding);
    }

    #[test]
    fn test_set_unknown_global_defines_in_vm_globals() {
        let mut vm = Vm::new();
        let id = vm.strings.intern("fresh");
        let name = Value::Str(id);
        let mut chunk = Chunk::new();
        let name_idx = chunk.add_constant(name) as u8;
        chunk.emit_constant(Value::Number(7.0), 1);
        chunk.write_op(OpCode::SetGlobal, 1);
        chunk.write_byte(name_idx, 1);
        chunk.write_op(OpCode::Return, 1);
        assert_eq!(run_ok(&mut vm, chunk), Value::Number(7.0));
        assert_eq!(vm.globals.get(&id).copied(), Some(Value::Number(7.0)));
    }

    #[test]
    fn test_jump_if_false_inspects_without_popping() {
        let mut vm = Vm::new();
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::False, 1);
        let jump = chunk.emit_jump(OpCode::JumpIfFalse, 1);
        // Skipped.
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Pop, 1);
        chunk.patch_jump(jump);
        // The condition is still on the stack.
        chunk.write_op(OpCode::Return, 1);
        assert_eq!(run_ok(&mut vm, chunk), Value::Bool(false));
    }

    #[test]
    fn test_loop_counts_down() {
        let mut vm = Vm::new();
        let mut chunk = Chunk::new();
        // local counter = 3; while counter > 0: counter = counter - 1
        chunk.emit_constant(Value::Number(3.0), 1);
        let loop_start = chunk.len();
        chunk.write_op(OpCode::Dup, 2);
        chunk.emit_constant(Value::Number(0.0), 2);
        chunk.write_op(OpCode::Greater, 2);
        let exit = chunk.emit_jump(OpCode::JumpIfFalse, 2);
        chunk.write_op(OpCode::Pop, 2);
        chunk.emit_constant(Value::Number(1.0), 3);
        chunk.write_op(OpCode::Subtract, 3);
        chunk.emit_loop(loop_start, 3);
        chunk.patch_jump(exit);
        chunk.write_op(OpCode::Pop, 4);
        chunk.write_op(OpCode::Return, 4);
        assert_eq!(run_ok(&mut vm, chunk), Value::Number(0.0));
    }

    #[test]
    fn test_call_with_wrong_arity_is_arity_error() {
        let mut vm = Vm::new();
        let f_name = vm.strings.intern("f");
        let mut inner = Chunk::new();
        inner.write_op(OpCode::GetLocal, 1);
        inner.write_byte(1, 1);
        inner.write_op(OpCode::Return, 1);
        let mut function = Function::new(f_name, 1, inner);
        function.upvalue_count = 0;
        let fh = vm.alloc(HeapData::Function(function)).unwrap();

        let mut chunk = Chunk::new();
        let f_idx = chunk.add_constant(Value::Function(fh)) as u8;
        chunk.write_op(OpCode::Closure, 3);
        chunk.write_byte(f_idx, 3);
        chunk.emit_constant(Value::Number(1.0), 3);
        chunk.emit_constant(Value::Number(2.0), 3);
        chunk.write_op(OpCode::Call, 3);
        chunk.write_byte(2, 3);
        chunk.write_op(OpCode::Return, 3);
        let err = run(&mut vm, chunk).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Arity);
        // The trace names the script and the failing line.
        assert_eq!(err.trace.last().unwrap().function, "<script>");
        assert_eq!(err.trace.last().unwrap().line, 3);
    }

    #[test]
    fn test_call_non_callable_is_type_error() {
        let mut vm = Vm::new();
        let mut chunk = Chunk::new();
        chunk.emit_constant(Value::Number(1.0), 1);
        chunk.write_op(OpCode::Call, 1);
        chunk.write_byte(0, 1);
        chunk.write_op(OpCode::Return, 1);
        let err = run(&mut vm, chunk).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Type);
    }

    #[test]
    fn test_function_call_returns_value() {
        let mut vm = Vm::new();
        // fn double(x) { return x + x }
        let name = vm.strings.intern("double");
        let mut inner = Chunk::new();
        inner.write_op(OpCode::GetLocal, 1);
        inner.write_byte(1, 1);
        inner.write_op(OpCode::GetLocal, 1);
        inner.write_byte(1, 1);
        inner.write_op(OpCode::Add, 1);
        inner.write_op(OpCode::Return, 1);
        let function = Function::new(name, 1, inner);
        let fh = vm.alloc(HeapData::Function(function)).unwrap();

        let mut chunk = Chunk::new();
        let f_idx = chunk.add_constant(Value::Function(fh)) as u8;
        chunk.write_op(OpCode::Closure, 1);
        chunk.write_byte(f_idx, 1);
        chunk.emit_constant(Value::Number(21.0), 1);
        chunk.write_op(OpCode::Call, 1);
        chunk.write_byte(1, 1);
        chunk.write_op(OpCode::Return, 1);
        assert_eq!(run_ok(&mut vm, chunk), Value::Number(42.0));
    }

    #[test]
    fn test_object_literal_preserves_order() {
        let mut vm = Vm::new();
        let b = Value::Str(vm.strings.intern("b"));
        let a = Value::Str(vm.strings.intern("a"));
        let mut chunk = Chunk::new();
        chunk.emit_constant(b, 1);
        chunk.emit_constant(Value::Number(1.0), 1);
        chunk.emit_constant(a, 1);
        chunk.emit_constant(Value::Number(2.0), 1);
        chunk.write_op(OpCode::ObjectLiteral, 1);
        chunk.write_byte(2, 1);
        chunk.write_op(OpCode::Return, 1);
        let result = run_ok(&mut vm, chunk);
        let Value::Object(handle) = result else {
            panic!("expected object")
        };
        let keys: Vec<&str> = vm
            .heap
            .object(handle)
            .unwrap()
            .iter()
            .map(|(k, _)| vm.strings.resolve(k))
            .collect();
        assert_eq!(keys, vec!["b", "a"]);
    }

    #[test]
    fn test_build_array_sets_length_and_keys() {
        let mut vm = Vm::new();
        let mut chunk = Chunk::new();
        chunk.emit_constant(Value::Number(10.0), 1);
        chunk.emit_constant(Value::Number(20.0), 1);
        chunk.write_op(OpCode::BuildArray, 1);
        chunk.write_byte(2, 1);
        chunk.write_op(OpCode::Length, 1);
        chunk.write_op(OpCode::Return, 1);
        assert_eq!(run_ok(&mut vm, chunk), Value::Number(2.0));
    }

    #[test]
    fn test_subscript_reads_array_elements_in_order() {
        let mut vm = Vm::new();
        let mut chunk = Chunk::new();
        chunk.emit_constant(Value::Number(10.0), 1);
        chunk.emit_constant(Value::Number(20.0), 1);
        chunk.write_op(OpCode::BuildArray, 1);
        chunk.write_byte(2, 1);
        chunk.emit_constant(Value::Number(1.0), 2);
        chunk.write_op(OpCode::GetSubscript, 2);
        chunk.write_op(OpCode::Return, 2);
        assert_eq!(run_ok(&mut vm, chunk), Value::Number(20.0));
    }

    #[test]
    fn test_array_subscript_out_of_range_gives_nil() {
        let mut vm = Vm::new();
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::BuildArray, 1);
        chunk.write_byte(0, 1);
        chunk.emit_constant(Value::Number(5.0), 1);
        chunk.write_op(OpCode::GetSubscript, 1);
        chunk.write_op(OpCode::Return, 1);
        assert_eq!(run_ok(&mut vm, chunk), Value::Nil);
    }

    #[test]
    fn test_set_subscript_past_length_extends_array() {
        let mut vm = Vm::new();
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::BuildArray, 1);
        chunk.write_byte(0, 1);
        chunk.write_op(OpCode::Dup, 1);
        chunk.emit_constant(Value::Number(4.0), 2);
        chunk.emit_constant(Value::Number(99.0), 2);
        chunk.write_op(OpCode::SetSubscript, 2);
        chunk.write_op(OpCode::Pop, 2);
        chunk.write_op(OpCode::Length, 3);
        chunk.write_op(OpCode::Return, 3);
        assert_eq!(run_ok(&mut vm, chunk), Value::Number(5.0));
    }

    #[test]
    fn test_string_subscript_and_bounds() {
        let mut vm = Vm::new();
        let s = Value::Str(vm.strings.intern("abc"));
        let mut chunk = Chunk::new();
        chunk.emit_constant(s, 1);
        chunk.emit_constant(Value::Number(1.0), 1);
        chunk.write_op(OpCode::GetSubscript, 1);
        chunk.write_op(OpCode::Return, 1);
        let result = run_ok(&mut vm, chunk);
        assert_eq!(result, Value::Str(vm.strings.intern("b")));

        let s = Value::Str(vm.strings.intern("abc"));
        let mut chunk = Chunk::new();
        chunk.emit_constant(s, 1);
        chunk.emit_constant(Value::Number(3.0), 1);
        chunk.write_op(OpCode::GetSubscript, 1);
        chunk.write_op(OpCode::Return, 1);
        let err = run(&mut vm, chunk).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Bounds);
    }

    #[test]
    fn test_strings_are_read_only() {
        let mut vm = Vm::new();
        let s = Value::Str(vm.strings.intern("abc"));
        let mut chunk = Chunk::new();
        chunk.emit_constant(s, 1);
        chunk.emit_constant(Value::Number(0.0), 1);
        chunk.emit_constant(Value::Number(1.0), 1);
        chunk.write_op(OpCode::SetSubscript, 1);
        chunk.write_op(OpCode::Return, 1);
        let err = run(&mut vm, chunk).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Type);
    }

    #[test]
    fn test_struct_define_create_and_fields() {
        let mut vm = Vm::new();
        let point = Value::Str(vm.strings.intern("Point"));
        let x = Value::Str(vm.strings.intern("x"));
        let y = Value::Str(vm.strings.intern("y"));
        let mut chunk = Chunk::new();
        let point_idx = chunk.add_constant(point) as u8;
        let x_idx = chunk.add_constant(x) as u8;
        let y_idx = chunk.add_constant(y) as u8;
        chunk.write_op(OpCode::DefineStruct, 1);
        chunk.write_byte(point_idx, 1);
        chunk.write_byte(2, 1);
        chunk.write_byte(x_idx, 1);
        chunk.write_byte(y_idx, 1);
        chunk.emit_constant(Value::Number(3.0), 2);
        chunk.emit_constant(Value::Number(4.0), 2);
        chunk.write_op(OpCode::CreateStruct, 2);
        chunk.write_byte(point_idx, 2);
        chunk.write_op(OpCode::GetField, 3);
        chunk.write_byte(y_idx, 3);
        chunk.write_op(OpCode::Return, 3);
        assert_eq!(run_ok(&mut vm, chunk), Value::Number(4.0));
    }

    #[test]
    fn test_struct_assignment_copies_value() {
        let mut vm = Vm::new();
        let point = Value::Str(vm.strings.intern("P"));
        let x = Value::Str(vm.strings.intern("x"));
        let a_name = Value::Str(vm.strings.intern("a"));
        let b_name = Value::Str(vm.strings.intern("b"));
        let mut chunk = Chunk::new();
        let point_idx = chunk.add_constant(point) as u8;
        let x_idx = chunk.add_constant(x) as u8;
        let a_idx = chunk.add_constant(a_name) as u8;
        let b_idx = chunk.add_constant(b_name) as u8;
        // struct P { x }; a = P(1); b = a; b.x = 9; return a.x
        chunk.write_op(OpCode::DefineStruct, 1);
        chunk.write_byte(point_idx, 1);
        chunk.write_byte(1, 1);
        chunk.write_byte(x_idx, 1);
        chunk.emit_constant(Value::Number(1.0), 2);
        chunk.write_op(OpCode::CreateStruct, 2);
        chunk.write_byte(point_idx, 2);
        chunk.write_op(OpCode::DefineGlobal, 2);
        chunk.write_byte(a_idx, 2);
        chunk.write_op(OpCode::GetGlobal, 3);
        chunk.write_byte(a_idx, 3);
        chunk.write_op(OpCode::DefineGlobal, 3);
        chunk.write_byte(b_idx, 3);
        chunk.write_op(OpCode::GetGlobal, 4);
        chunk.write_byte(b_idx, 4);
        chunk.emit_constant(Value::Number(9.0), 4);
        chunk.write_op(OpCode::SetField, 4);
        chunk.write_byte(x_idx, 4);
        chunk.write_op(OpCode::Pop, 4);
        chunk.write_op(OpCode::GetGlobal, 5);
        chunk.write_byte(a_idx, 5);
        chunk.write_op(OpCode::GetField, 5);
        chunk.write_byte(x_idx, 5);
        chunk.write_op(OpCode::Return, 5);
        assert_eq!(
            run_ok(&mut vm, chunk),
            Value::Number(1.0),
            "b got its own copy; writing b.x must not touch a.x"
        );
    }

    #[test]
    fn test_await_is_rejected() {
        let mut vm = Vm::new();
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Await, 1);
        chunk.write_op(OpCode::Return, 1);
        let err = run(&mut vm, chunk).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Type);
        assert!(err.message.contains("await"));
    }

    #[test]
    fn test_halt_terminates_cleanly() {
        let mut vm = Vm::new();
        let mut chunk = Chunk::new();
        chunk.emit_constant(Value::Number(1.0), 1);
        chunk.write_op(OpCode::Halt, 1);
        assert_eq!(run_ok(&mut vm, chunk), Value::Nil);
        assert_eq!(vm.stack_depth(), 0);
        assert_eq!(vm.frame_count(), 0);
    }

    #[test]
    fn test_to_string_and_interp() {
        let mut vm = Vm::new();
        let prefix = Value::Str(vm.strings.intern("n="));
        let mut chunk = Chunk::new();
        chunk.emit_constant(prefix, 1);
        chunk.emit_constant(Value::Number(5.0), 1);
        chunk.write_op(OpCode::ToString, 1);
        chunk.write_op(OpCode::StringInterp, 1);
        chunk.write_byte(2, 1);
        chunk.write_op(OpCode::Return, 1);
        let result = run_ok(&mut vm, chunk);
        assert_eq!(result, Value::Str(vm.strings.intern("n=5")));
    }

    #[test]
    fn test_stack_balance_after_balanced_program() {
        let mut vm = Vm::new();
        let mut chunk = Chunk::new();
        for _ in 0..10 {
            chunk.write_op(OpCode::True, 1);
        }
        for _ in 0..10 {
            chunk.write_op(OpCode::Pop, 1);
        }
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Return, 1);
        run_ok(&mut vm, chunk);
        assert_eq!(vm.stack_depth(), 0);
    }
}
