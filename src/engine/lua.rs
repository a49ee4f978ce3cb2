//! Lua 5.4 engine.
//!
//! Console functions (`print`, `io.write`, `io.read`, `os.exit`) are
//! replaced by functions that route through the attached [`Host`], and a
//! `host` table exposes the raw callbacks. `io.read` reads one line from
//! the controller; the `"n"` format converts it with `tonumber`, every
//! other format returns the line as a string.
//!
//! Values cross the protocol in a small tagged binary encoding implemented
//! in Lua itself.
//!
//! Once any callback reports [`Halted`], every later instruction raises
//! `Halted` as well, including under `pcall`.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use anyhow::{anyhow, Result};
use mlua::{Function, HookTriggers, Lua, Table, Value, Variadic};
use tracing::{debug, warn};

use super::{Engine, Host, Noun, NounType, Status, UnsupportedRequest, OK};
use crate::config::EngineConfig;
use crate::error::Halted;
use crate::transport::OutputCategory;

pub const RUNTIME_ERROR: Status = 1;
pub const SYNTAX_ERROR: Status = 2;
pub const MEMORY_ERROR: Status = 3;
/// Name has no value.
pub const VALUE_ERROR: Status = 4;
/// Value has no Lua representation.
pub const DOMAIN_ERROR: Status = 5;
/// Evaluation abandoned because the session is halting.
pub const INTERRUPTED: Status = 6;

/// Value codec.
///
/// `s` string (u32 length prefix), `i` integer, `f` float, `T`/`F`
/// booleans, `t` table (u32 pair count, then key/value pairs).
const CODEC: &str = r#"
local pack, unpack = string.pack, string.unpack
local concat, mtype = table.concat, math.type

local encode
encode = function(v)
  local kind = type(v)
  if kind == "string" then
    return "s" .. pack(">s4", v)
  elseif kind == "number" then
    if mtype(v) == "integer" then
      return "i" .. pack(">i8", v)
    end
    return "f" .. pack(">d", v)
  elseif kind == "boolean" then
    return v and "T" or "F"
  elseif kind == "table" then
    local parts, n = {}, 0
    for k, x in pairs(v) do
      n = n + 1
      parts[#parts + 1] = encode(k)
      parts[#parts + 1] = encode(x)
    end
    return "t" .. pack(">I4", n) .. concat(parts)
  end
  error("domain error: cannot serialize a " .. kind, 0)
end

local decode_at
decode_at = function(s, pos)
  local tag = s:sub(pos, pos)
  pos = pos + 1
  if tag == "s" then
    return unpack(">s4", s, pos)
  elseif tag == "i" then
    return unpack(">i8", s, pos)
  elseif tag == "f" then
    return unpack(">d", s, pos)
  elseif tag == "T" then
    return true, pos
  elseif tag == "F" then
    return false, pos
  elseif tag == "t" then
    local n
    n, pos = unpack(">I4", s, pos)
    local out = {}
    for _ = 1, n do
      local k, x
      k, pos = decode_at(s, pos)
      x, pos = decode_at(s, pos)
      out[k] = x
    end
    return out, pos
  end
  error("domain error: bad value tag at byte " .. (pos - 1), 0)
end

_REPLINK = {
  encode = encode,
  decode = function(s)
    if type(s) ~= "string" then
      error("domain error: serialized value must be a string", 0)
    end
    local v, pos = decode_at(s, 1)
    if pos ~= #s + 1 then
      error("length error: trailing bytes in serialized value", 0)
    end
    return v
  end,
}
"#;

type HostCell = Rc<RefCell<Option<Weak<dyn Host>>>>;

/// Engine backed by an embedded Lua state.
pub struct LuaEngine {
    lua: Lua,
    host: HostCell,
}

impl LuaEngine {
    /// Create a Lua state with host functions and the value codec loaded.
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let lua = Lua::new();
        let host: HostCell = Rc::new(RefCell::new(None));

        if let Some(limit) = config.memory_limit_bytes {
            lua.set_memory_limit(limit)
                .map_err(|e| anyhow!("Failed to set interpreter memory limit: {e}"))?;
        }
        install_host_functions(&lua, &host)
            .map_err(|e| anyhow!("Failed to register host functions: {e}"))?;
        lua.load(CODEC)
            .set_name("=codec")
            .exec()
            .map_err(|e| anyhow!("Failed to load value codec: {e}"))?;
        if config.sandbox {
            restrict(&lua).map_err(|e| anyhow!("Failed to sandbox interpreter: {e}"))?;
        }

        debug!(
            sandbox = config.sandbox,
            memory_limit = ?config.memory_limit_bytes,
            "Lua engine ready"
        );
        Ok(Self { lua, host })
    }

    fn host(&self) -> Option<Rc<dyn Host>> {
        self.host.borrow().as_ref().and_then(Weak::upgrade)
    }

    /// Map an evaluation error to a status, echoing its text as error output.
    fn report(&self, err: &mlua::Error) -> Status {
        if is_halt(err) || is_halting(&self.lua) {
            debug!("Evaluation interrupted by halt");
            return INTERRUPTED;
        }
        let status = match err {
            mlua::Error::SyntaxError { .. } => SYNTAX_ERROR,
            mlua::Error::MemoryError(_) => MEMORY_ERROR,
            _ => RUNTIME_ERROR,
        };
        let text = format!("{err}\n");
        if let Some(host) = self.host() {
            if host.output(OutputCategory::Error.code(), text.as_bytes()).is_err() {
                halt(&self.lua);
                return INTERRUPTED;
            }
        }
        status
    }
}

impl Engine for LuaEngine {
    fn attach(&self, host: Weak<dyn Host>) {
        *self.host.borrow_mut() = Some(host);
    }

    fn execute(&self, source: &[u8]) -> Status {
        if is_halting(&self.lua) {
            return INTERRUPTED;
        }
        match self.lua.load(source).set_name("=input").exec() {
            Ok(()) => OK,
            Err(err) => self.report(&err),
        }
    }

    fn get_value(&self, name: &str) -> Result<Noun, Status> {
        let value: Value = self.lua.globals().get(name).map_err(|err| {
            warn!(name, error = %err, "Failed to read global");
            RUNTIME_ERROR
        })?;
        noun_of(&value).ok_or(VALUE_ERROR)
    }

    fn set_value(&self, name: &str, value: &Noun) -> Status {
        let converted = match value_of(&self.lua, value) {
            Ok(Some(converted)) => converted,
            Ok(None) => return DOMAIN_ERROR,
            Err(mlua::Error::MemoryError(_)) => return MEMORY_ERROR,
            Err(_) => return RUNTIME_ERROR,
        };
        match self.lua.globals().set(name, converted) {
            Ok(()) => OK,
            Err(err) => {
                warn!(name, error = %err, "Failed to assign global");
                RUNTIME_ERROR
            }
        }
    }

    fn clear_script(&self, slot: &str) -> Vec<u8> {
        format!("{slot} = nil").into_bytes()
    }

    fn bind_script(&self, slot: &str, expression: &[u8]) -> Vec<u8> {
        let mut script = format!("{slot} = (\n").into_bytes();
        script.extend_from_slice(expression);
        script.extend_from_slice(b"\n)");
        script
    }

    fn serialize_script(&self, reply: &str, source: &str) -> Vec<u8> {
        format!(
            "if {source} == nil then error(\"value error\", 0) end \
             {reply} = _REPLINK.encode({source})"
        )
        .into_bytes()
    }

    fn deserialize_script(&self, name_slot: &str, reply: &str) -> Vec<u8> {
        format!("_G[{name_slot}] = _REPLINK.decode({reply})").into_bytes()
    }

    fn shutdown(self) -> Result<()> {
        self.host.borrow_mut().take();
        self.lua.remove_hook();
        self.lua
            .gc_collect()
            .map_err(|e| anyhow!("Failed to collect interpreter state: {e}"))?;
        debug!("Lua engine shut down");
        Ok(())
    }
}

/// Marker kept in app data once the state has been halted.
struct Halting;

fn current_host(lua: &Lua, cell: &HostCell) -> mlua::Result<Rc<dyn Host>> {
    let host = cell.borrow().as_ref().and_then(Weak::upgrade);
    host.ok_or_else(|| halt(lua))
}

/// Stop all Lua code still on the stack. From now on every instruction
/// raises `Halted`.
fn halt(lua: &Lua) -> mlua::Error {
    if lua.set_app_data(Halting).is_none() {
        debug!("Arming halt hook");
        lua.set_hook(HookTriggers::new().every_nth_instruction(1), |_, _| {
            Err(mlua::Error::external(Halted))
        });
    }
    mlua::Error::external(Halted)
}

fn is_halting(lua: &Lua) -> bool {
    lua.app_data_ref::<Halting>().is_some()
}

fn is_halt(err: &mlua::Error) -> bool {
    match err {
        mlua::Error::ExternalError(inner) => inner.downcast_ref::<Halted>().is_some(),
        mlua::Error::CallbackError { cause, .. } | mlua::Error::WithContext { cause, .. } => {
            is_halt(cause)
        }
        _ => false,
    }
}

fn render(tostring: &Function, values: &[Value], separator: &[u8]) -> mlua::Result<Vec<u8>> {
    let mut text = Vec::new();
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            text.extend_from_slice(separator);
        }
        let piece: mlua::String = tostring.call(value.clone())?;
        text.extend_from_slice(&piece.as_bytes());
    }
    Ok(text)
}

fn exit_text(tostring: &Function, status: Value) -> mlua::Result<Vec<u8>> {
    Ok(match status {
        Value::Nil | Value::Boolean(true) => b"0".to_vec(),
        Value::Boolean(false) => b"1".to_vec(),
        other => {
            let text: mlua::String = tostring.call(other)?;
            text.as_bytes().to_vec()
        }
    })
}

fn install_host_functions(lua: &Lua, cell: &HostCell) -> mlua::Result<()> {
    let globals = lua.globals();
    let tostring: Function = globals.get("tostring")?;
    let io: Table = globals.get("io")?;
    let os: Table = globals.get("os")?;
    let host = lua.create_table()?;

    let print = {
        let (cell, tostring) = (Rc::clone(cell), tostring.clone());
        lua.create_function(move |lua, values: Variadic<Value>| {
            let mut text = render(&tostring, &values, b"\t")?;
            text.push(b'\n');
            current_host(lua, &cell)?
                .output(OutputCategory::Formatted.code(), &text)
                .map_err(|_| halt(lua))
        })?
    };
    globals.set("print", print)?;

    let write = {
        let (cell, tostring) = (Rc::clone(cell), tostring.clone());
        lua.create_function(move |lua, values: Variadic<Value>| {
            let text = render(&tostring, &values, b"")?;
            current_host(lua, &cell)?
                .output(OutputCategory::Formatted.code(), &text)
                .map_err(|_| halt(lua))
        })?
    };
    io.set("write", write)?;

    let input = {
        let cell = Rc::clone(cell);
        lua.create_function(move |lua, prompt: Option<mlua::String>| {
            let prompt = prompt.map(|p| p.as_bytes().to_vec()).unwrap_or_default();
            let line = current_host(lua, &cell)?
                .request_input(&prompt)
                .map_err(|_| halt(lua))?;
            lua.create_string(line.as_bytes())
        })?
    };
    host.set("input", input)?;

    let read = {
        let cell = Rc::clone(cell);
        let tonumber: Function = globals.get("tonumber")?;
        lua.create_function(move |lua, formats: Variadic<Value>| {
            let line = current_host(lua, &cell)?
                .request_input(b"")
                .map_err(|_| halt(lua))?;
            let text = lua.create_string(line.as_bytes())?;
            match formats.first() {
                Some(Value::String(format)) if matches!(&*format.as_bytes(), b"n" | b"*n") => {
                    tonumber.call::<Value>(text)
                }
                _ => Ok(Value::String(text)),
            }
        })?
    };
    io.set("read", read)?;

    let output = {
        let cell = Rc::clone(cell);
        lua.create_function(move |lua, (category, text): (i32, mlua::String)| {
            current_host(lua, &cell)?
                .output(category, &text.as_bytes())
                .map_err(|_| halt(lua))
        })?
    };
    host.set("output", output)?;

    let exit = {
        let (cell, tostring) = (Rc::clone(cell), tostring);
        lua.create_function(move |lua, status: Value| {
            let text = exit_text(&tostring, status)?;
            // Stop even when the host accepts the request.
            let _ = current_host(lua, &cell)?.output(OutputCategory::Exit.code(), &text);
            Err::<(), _>(halt(lua))
        })?
    };
    host.set("exit", exit.clone())?;
    os.set("exit", exit)?;

    let request = {
        let cell = Rc::clone(cell);
        lua.create_function(move |lua, (minor, argument): (i32, Value)| {
            let request = UnsupportedRequest {
                minor,
                argument: noun_of(&argument).unwrap_or_else(|| Noun {
                    kind: NounType::Other(0),
                    shape: Vec::new(),
                    data: Vec::new(),
                }),
            };
            current_host(lua, &cell)?.unsupported(&request);
            Err::<(), _>(halt(lua))
        })?
    };
    host.set("request", request)?;

    globals.set("host", host)
}

/// Remove file, process and module loading access.
fn restrict(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();
    for name in ["dofile", "loadfile", "require", "package"] {
        globals.set(name, Value::Nil)?;
    }
    let io: Table = globals.get("io")?;
    for name in ["open", "popen", "lines", "input", "output", "close", "tmpfile"] {
        io.set(name, Value::Nil)?;
    }
    let os: Table = globals.get("os")?;
    for name in ["execute", "remove", "rename", "tmpname", "getenv"] {
        os.set(name, Value::Nil)?;
    }
    Ok(())
}

fn noun_of(value: &Value) -> Option<Noun> {
    let scalar = |kind, data: Vec<u8>| Noun {
        kind,
        shape: Vec::new(),
        data,
    };
    Some(match value {
        Value::Nil => return None,
        Value::Boolean(b) => scalar(NounType::Boolean, vec![u8::from(*b)]),
        Value::Integer(i) => scalar(NounType::Integer, i.to_le_bytes().to_vec()),
        Value::Number(n) => scalar(NounType::Float, n.to_le_bytes().to_vec()),
        Value::String(s) => Noun::bytes(s.as_bytes().to_vec()),
        Value::Table(_) => scalar(NounType::Boxed, Vec::new()),
        _ => scalar(NounType::Other(0), Vec::new()),
    })
}

fn value_of(lua: &Lua, noun: &Noun) -> mlua::Result<Option<Value>> {
    let fixed = |data: &[u8]| <[u8; 8]>::try_from(data).ok();
    Ok(match (noun.kind, noun.rank()) {
        (NounType::Literal, 0) => Some(Value::String(lua.create_string(&noun.data)?)),
        (NounType::Literal, 1) => match noun.as_byte_vector() {
            Some(bytes) => Some(Value::String(lua.create_string(bytes)?)),
            None => None,
        },
        (NounType::Integer, 0) => fixed(&noun.data).map(|b| Value::Integer(i64::from_le_bytes(b))),
        (NounType::Float, 0) => fixed(&noun.data).map(|b| Value::Number(f64::from_le_bytes(b))),
        (NounType::Boolean, 0) => noun.data.first().map(|&b| Value::Boolean(b != 0)),
        _ => None,
    })
}
