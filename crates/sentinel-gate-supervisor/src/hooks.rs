// crates/sentinel-gate-supervisor/src/hooks.rs
// ============================================================================
// Module: Embedded Hook Scripts
// Description: Python and Node interception hooks written at bootstrap.
// Purpose: Intercept subprocess/file/HTTP calls inside the child and consult
//          the gateway's decision API synchronously.
// Dependencies: none (const script sources)
// ============================================================================

//! ## Overview
//! Two scripts, one per runtime. Both implement the same contract: a
//! synchronous decision call per intercepted action, an LRU+TTL cache of
//! allow decisions, a recursion guard, configurable fail-open/fail-closed
//! behavior, approval polling, a bounded audit ring with periodic and
//! exit-time flushes, and path exclusions. The Python script ships as
//! `sitecustomize.py` so a `PYTHONPATH` prepend activates it; the Node script
//! loads through `NODE_OPTIONS --require`.

// ============================================================================
// SECTION: Python Hook
// ============================================================================

/// Python hook source, written to `<bootstrap>/python/sitecustomize.py`.
pub const PYTHON_HOOK: &str = r#"# SentinelGate runtime hook (Python).
# Loaded through the PYTHONPATH sitecustomize mechanism; intercepts
# subprocess execution, file I/O, and outbound HTTP, consulting the gateway
# decision API synchronously.

import atexit
import builtins
import collections
import hashlib
import json
import os
import sys
import threading
import time
import urllib.request

_SERVER = os.environ.get("SENTINELGATE_SERVER_ADDR", "127.0.0.1:8400")
_API_KEY = os.environ.get("SENTINELGATE_API_KEY", "")
_AGENT_ID = os.environ.get("SENTINELGATE_AGENT_ID", "")
_FAIL_MODE = os.environ.get("SENTINELGATE_FAIL_MODE", "open")
_CACHE_TTL = float(os.environ.get("SENTINELGATE_CACHE_TTL", "5"))
_CACHE_CAPACITY = int(os.environ.get("SENTINELGATE_CACHE_CAPACITY", "1000"))
_DEBUG_PATH = os.environ.get("SENTINELGATE_HOOK_DEBUG", "")
_BOOTSTRAP_DIR = os.path.dirname(os.path.dirname(os.path.abspath(__file__)))

_POLL_INTERVAL = 2.0
_MAX_POLLS = 30
_AUDIT_CAPACITY = 500
_FLUSH_INTERVAL = 10.0

_EXCLUDED_PARTS = ("node_modules",)
_EXCLUDED_PREFIXES = ("/dev/", "/proc/", "/sys/")

_guard = threading.local()
_cache = collections.OrderedDict()
_cache_lock = threading.Lock()
_audit = collections.deque(maxlen=_AUDIT_CAPACITY)
_audit_lock = threading.Lock()


def _debug(message):
    if not _DEBUG_PATH:
        return
    try:
        with open(_DEBUG_PATH, "a") as handle:
            handle.write("%s %s\n" % (time.time(), message))
    except OSError:
        pass


def _detect_framework():
    for probe, label in (
        ("crewai", "crewai"),
        ("autogen", "autogen"),
        ("langchain", "langchain"),
        ("agents", "openai-agents-sdk"),
    ):
        try:
            __import__(probe)
            return label
        except Exception:
            continue
    return os.environ.get("SENTINELGATE_FRAMEWORK", "")


_FRAMEWORK = None


def _framework():
    global _FRAMEWORK
    if _FRAMEWORK is None:
        _FRAMEWORK = _detect_framework()
    return _FRAMEWORK


def _excluded_path(path):
    if not isinstance(path, str):
        return False
    if path.startswith(_BOOTSTRAP_DIR):
        return True
    if path.endswith(".lock"):
        return True
    for part in _EXCLUDED_PARTS:
        if part in path.split(os.sep):
            return True
    for prefix in _EXCLUDED_PREFIXES:
        if path.startswith(prefix):
            return True
    return False


def _cache_key(action_type, action_name, arguments):
    digest = hashlib.sha256(
        json.dumps(arguments, sort_keys=True, default=str).encode()
    ).hexdigest()
    return (action_type, action_name, digest)


def _cache_get(key):
    now = time.monotonic()
    with _cache_lock:
        entry = _cache.get(key)
        if entry is None:
            return None
        decision, expires = entry
        if expires < now:
            del _cache[key]
            return None
        _cache.move_to_end(key)
        return decision


def _cache_put(key, decision):
    # Only allow decisions are cached; deny and approval_required re-check.
    if decision != "allow":
        return
    with _cache_lock:
        _cache[key] = (decision, time.monotonic() + _CACHE_TTL)
        _cache.move_to_end(key)
        while len(_cache) > _CACHE_CAPACITY:
            _cache.popitem(last=False)


def _post(path, payload, timeout=5.0):
    body = json.dumps(payload).encode()
    request = urllib.request.Request(
        "http://%s%s" % (_SERVER, path),
        data=body,
        headers={
            "Content-Type": "application/json",
            "Authorization": "Bearer %s" % _API_KEY,
        },
        method="POST",
    )
    opener = urllib.request.build_opener(urllib.request.ProxyHandler({}))
    with opener.open(request, timeout=timeout) as response:
        return json.loads(response.read().decode())


def _get(path, timeout=5.0):
    request = urllib.request.Request(
        "http://%s%s" % (_SERVER, path),
        headers={"Authorization": "Bearer %s" % _API_KEY},
    )
    opener = urllib.request.build_opener(urllib.request.ProxyHandler({}))
    with opener.open(request, timeout=timeout) as response:
        return json.loads(response.read().decode())


def _record(action_type, action_name, decision):
    with _audit_lock:
        _audit.append(
            {
                "action_type": action_type,
                "action_name": action_name,
                "decision": decision,
                "timestamp": time.strftime("%Y-%m-%dT%H:%M:%S%z"),
            }
        )


def _flush_audit():
    with _audit_lock:
        batch = list(_audit)
    if not batch:
        return
    try:
        _post("/admin/api/v1/audit/events", batch, timeout=3.0)
        with _audit_lock:
            for _ in range(min(len(batch), len(_audit))):
                _audit.popleft()
    except Exception as err:
        _debug("audit flush failed: %s" % err)


def _flusher():
    while True:
        time.sleep(_FLUSH_INTERVAL)
        _flush_audit()


def _poll_approval(request_id):
    for _ in range(_MAX_POLLS):
        time.sleep(_POLL_INTERVAL)
        try:
            status = _get(
                "/admin/api/v1/policy/evaluate/%s/status" % request_id
            )
        except Exception as err:
            _debug("approval poll failed: %s" % err)
            continue
        decision = status.get("decision", "")
        if decision == "allow":
            return "allow"
        if decision == "deny":
            return "deny"
    return "deny"


def _deny(action_name, reason):
    raise PermissionError(
        "SentinelGate denied %s: %s" % (action_name, reason)
    )


def _check(action_type, action_name, arguments):
    if getattr(_guard, "active", False):
        return
    key = _cache_key(action_type, action_name, arguments)
    if _cache_get(key) == "allow":
        return
    _guard.active = True
    try:
        try:
            result = _post(
                "/admin/api/v1/policy/evaluate",
                {
                    "action_type": action_type,
                    "action_name": action_name,
                    "arguments": arguments,
                    "protocol": "runtime",
                    "framework": _framework(),
                    "identity_name": _AGENT_ID or "runtime-agent",
                    "identity_roles": ["agent"],
                },
            )
        except Exception as err:
            if _FAIL_MODE == "closed":
                _record(action_type, action_name, "deny")
                _deny(action_name, "gateway unreachable (fail-closed)")
            sys.stderr.write(
                "sentinelgate: gateway unreachable, allowing (%s)\n" % err
            )
            _record(action_type, action_name, "allow")
            return
        decision = result.get("decision", "deny")
        if decision == "approval_required":
            decision = _poll_approval(result.get("request_id", ""))
        _record(action_type, action_name, decision)
        _cache_put(key, decision)
        if decision != "allow":
            _deny(action_name, result.get("reason", "denied by policy"))
    finally:
        _guard.active = False


def _install():
    import subprocess

    original_popen_init = subprocess.Popen.__init__

    def guarded_popen_init(self, args, *pargs, **kwargs):
        argv = args if isinstance(args, (list, tuple)) else [args]
        executable = str(argv[0]) if argv else ""
        _check(
            "command_exec",
            executable,
            {"argv": [str(part) for part in argv]},
        )
        return original_popen_init(self, args, *pargs, **kwargs)

    subprocess.Popen.__init__ = guarded_popen_init

    original_open = builtins.open

    def guarded_open(file, mode="r", *pargs, **kwargs):
        path = file if isinstance(file, str) else getattr(file, "__fspath__", lambda: "")()
        if path and not _excluded_path(path):
            operation = "write" if any(flag in mode for flag in "wax+") else "read"
            _check("file_access", operation, {"path": path, "mode": mode})
        return original_open(file, mode, *pargs, **kwargs)

    builtins.open = guarded_open

    import http.client

    original_request = http.client.HTTPConnection.request

    def guarded_request(self, method, url, *pargs, **kwargs):
        if not getattr(_guard, "active", False):
            scheme = "https" if isinstance(
                self, http.client.HTTPSConnection
            ) else "http"
            _check(
                "http_request",
                method,
                {"url": "%s://%s:%s%s" % (scheme, self.host, self.port, url)},
            )
        return original_request(self, method, url, *pargs, **kwargs)

    http.client.HTTPConnection.request = guarded_request

    flusher = threading.Thread(target=_flusher, daemon=True)
    flusher.start()
    atexit.register(_flush_audit)
    _debug("python hook installed")


try:
    _install()
except Exception as err:
    sys.stderr.write("sentinelgate: hook install failed: %s\n" % err)
"#;

// ============================================================================
// SECTION: Node Hook
// ============================================================================

/// Node hook source, written to `<bootstrap>/node/node-hook.js`.
pub const NODE_HOOK: &str = r#"// SentinelGate runtime hook (Node).
// Loaded through NODE_OPTIONS --require; intercepts child processes, file
// I/O, and outbound HTTP, consulting the gateway decision API synchronously.
'use strict';

const childProcess = require('child_process');
const crypto = require('crypto');
const fs = require('fs');
const Module = require('module');
const path = require('path');

const SERVER = process.env.SENTINELGATE_SERVER_ADDR || '127.0.0.1:8400';
const API_KEY = process.env.SENTINELGATE_API_KEY || '';
const AGENT_ID = process.env.SENTINELGATE_AGENT_ID || '';
const FAIL_MODE = process.env.SENTINELGATE_FAIL_MODE || 'open';
const CACHE_TTL_MS = Number(process.env.SENTINELGATE_CACHE_TTL || '5') * 1000;
const CACHE_CAPACITY = Number(process.env.SENTINELGATE_CACHE_CAPACITY || '1000');
const DEBUG_PATH = process.env.SENTINELGATE_HOOK_DEBUG || '';
const BOOTSTRAP_DIR = path.dirname(__dirname);

const POLL_INTERVAL_MS = 2000;
const MAX_POLLS = 30;
const AUDIT_CAPACITY = 500;
const FLUSH_INTERVAL_MS = 10000;

// Unpatched primitives, captured before any interception.
const origReadFileSync = fs.readFileSync.bind(fs);
const origSpawnSync = childProcess.spawnSync.bind(childProcess);
const origAppendFileSync = fs.appendFileSync.bind(fs);

let inCheck = false;
const cache = new Map();
const auditRing = [];

function debug(message) {
  if (!DEBUG_PATH) return;
  try {
    origAppendFileSync(DEBUG_PATH, `${Date.now()} ${message}\n`);
  } catch (_err) {
    /* best effort */
  }
}

let frameworkLabel = null;
function detectFramework() {
  if (frameworkLabel !== null) return frameworkLabel;
  const probes = [
    ['@langchain/core', 'langchain'],
    ['langchain', 'langchain'],
    ['crewai', 'crewai'],
    ['autogen', 'autogen'],
    ['@openai/agents', 'openai-agents-sdk'],
  ];
  for (const [probe, label] of probes) {
    try {
      require.resolve(probe);
      frameworkLabel = label;
      return frameworkLabel;
    } catch (_err) {
      /* not installed */
    }
  }
  frameworkLabel = process.env.SENTINELGATE_FRAMEWORK || '';
  return frameworkLabel;
}

function excludedPath(target) {
  if (typeof target !== 'string') return false;
  if (target.startsWith(BOOTSTRAP_DIR)) return true;
  if (target.endsWith('.lock')) return true;
  if (target.split(path.sep).includes('node_modules')) return true;
  for (const prefix of ['/dev/', '/proc/', '/sys/']) {
    if (target.startsWith(prefix)) return true;
  }
  return false;
}

function cacheKey(actionType, actionName, args) {
  const digest = crypto
    .createHash('sha256')
    .update(JSON.stringify(args || {}))
    .digest('hex');
  return `${actionType}:${actionName}:${digest}`;
}

function cacheGet(key) {
  const entry = cache.get(key);
  if (!entry) return null;
  if (entry.expires < Date.now()) {
    cache.delete(key);
    return null;
  }
  cache.delete(key);
  cache.set(key, entry);
  return entry.decision;
}

function cachePut(key, decision) {
  // Only allow decisions are cached.
  if (decision !== 'allow') return;
  cache.set(key, { decision, expires: Date.now() + CACHE_TTL_MS });
  while (cache.size > CACHE_CAPACITY) {
    const oldest = cache.keys().next().value;
    cache.delete(oldest);
  }
}

// Node has no synchronous HTTP in the stdlib; a child Node process performs
// the blocking POST and prints the response body.
const SYNC_POST_SCRIPT = [
  "const http = require('http');",
  "let input = '';",
  "process.stdin.on('data', (c) => { input += c; });",
  "process.stdin.on('end', () => {",
  '  const spec = JSON.parse(input);',
  '  const req = http.request({',
  '    host: spec.host, port: spec.port, path: spec.path,',
  "    method: spec.method || 'POST',",
  "    headers: spec.headers, timeout: spec.timeoutMs || 5000,",
  '  }, (res) => {',
  "    let body = '';",
  "    res.on('data', (c) => { body += c; });",
  "    res.on('end', () => { process.stdout.write(body); process.exit(res.statusCode < 300 ? 0 : 3); });",
  '  });',
  "  req.on('timeout', () => { req.destroy(); process.exit(2); });",
  "  req.on('error', () => process.exit(2));",
  '  if (spec.body) req.write(spec.body);',
  '  req.end();',
  '});',
].join('\n');

function syncRequest(method, urlPath, payload) {
  const [host, port] = SERVER.split(':');
  const spec = {
    host,
    port: Number(port || '8400'),
    path: urlPath,
    method,
    headers: {
      'Content-Type': 'application/json',
      Authorization: `Bearer ${API_KEY}`,
    },
    body: payload ? JSON.stringify(payload) : undefined,
    timeoutMs: 5000,
  };
  const result = origSpawnSync(process.execPath, ['-e', SYNC_POST_SCRIPT], {
    input: JSON.stringify(spec),
    encoding: 'utf8',
    env: { PATH: process.env.PATH },
  });
  if (result.status !== 0 || !result.stdout) {
    return null;
  }
  try {
    return JSON.parse(result.stdout);
  } catch (_err) {
    return null;
  }
}

function sleepSync(ms) {
  Atomics.wait(new Int32Array(new SharedArrayBuffer(4)), 0, 0, ms);
}

function record(actionType, actionName, decision) {
  auditRing.push({
    action_type: actionType,
    action_name: actionName,
    decision,
    timestamp: new Date().toISOString(),
  });
  while (auditRing.length > AUDIT_CAPACITY) auditRing.shift();
}

function flushAudit() {
  if (auditRing.length === 0) return;
  const batch = auditRing.slice();
  const response = syncRequest('POST', '/admin/api/v1/audit/events', batch);
  if (response !== null) {
    auditRing.splice(0, batch.length);
  } else {
    debug('audit flush failed');
  }
}

function pollApproval(requestId) {
  for (let i = 0; i < MAX_POLLS; i += 1) {
    sleepSync(POLL_INTERVAL_MS);
    const status = syncRequest(
      'GET',
      `/admin/api/v1/policy/evaluate/${requestId}/status`,
      null,
    );
    if (status && status.decision === 'allow') return 'allow';
    if (status && status.decision === 'deny') return 'deny';
  }
  return 'deny';
}

function deny(actionName, reason) {
  const err = new Error(`SentinelGate denied ${actionName}: ${reason}`);
  err.code = 'SENTINELGATE_DENIED';
  throw err;
}

function check(actionType, actionName, args) {
  if (inCheck) return;
  const key = cacheKey(actionType, actionName, args);
  if (cacheGet(key) === 'allow') return;
  inCheck = true;
  try {
    const result = syncRequest('POST', '/admin/api/v1/policy/evaluate', {
      action_type: actionType,
      action_name: actionName,
      arguments: args,
      protocol: 'runtime',
      framework: detectFramework(),
      identity_name: AGENT_ID || 'runtime-agent',
      identity_roles: ['agent'],
    });
    if (result === null) {
      if (FAIL_MODE === 'closed') {
        record(actionType, actionName, 'deny');
        deny(actionName, 'gateway unreachable (fail-closed)');
      }
      process.stderr.write('sentinelgate: gateway unreachable, allowing\n');
      record(actionType, actionName, 'allow');
      return;
    }
    let decision = result.decision || 'deny';
    if (decision === 'approval_required') {
      decision = pollApproval(result.request_id || '');
    }
    record(actionType, actionName, decision);
    cachePut(key, decision);
    if (decision !== 'allow') {
      deny(actionName, result.reason || 'denied by policy');
    }
  } finally {
    inCheck = false;
  }
}

// Replace the module loaders with versions that read source through the
// unpatched primitive; otherwise a deny-all policy blocks every require.
function protectModuleLoader() {
  Module._extensions['.js'] = function loadJs(module, filename) {
    const source = origReadFileSync(filename, 'utf8');
    module._compile(source, filename);
  };
  Module._extensions['.json'] = function loadJson(module, filename) {
    const source = origReadFileSync(filename, 'utf8');
    module.exports = JSON.parse(source);
  };
}

function patchChildProcess() {
  for (const name of ['spawn', 'spawnSync', 'exec', 'execSync', 'execFile', 'execFileSync']) {
    const original = childProcess[name].bind(childProcess);
    childProcess[name] = function guarded(command, ...rest) {
      const argv = Array.isArray(rest[0]) ? rest[0] : [];
      check('command_exec', String(command), {
        argv: [String(command)].concat(argv.map(String)),
      });
      return original(command, ...rest);
    };
  }
}

function patchFs() {
  const guards = [
    ['readFileSync', 'read'],
    ['writeFileSync', 'write'],
    ['appendFileSync', 'write'],
    ['openSync', 'open'],
    ['unlinkSync', 'delete'],
  ];
  for (const [name, operation] of guards) {
    const original = fs[name].bind(fs);
    fs[name] = function guarded(target, ...rest) {
      const asPath = typeof target === 'string' ? target : '';
      if (asPath && !excludedPath(asPath)) {
        check('file_access', operation, { path: asPath });
      }
      return original(target, ...rest);
    };
  }
}

function patchHttp() {
  for (const proto of ['http', 'https']) {
    const mod = require(proto);
    const originalRequest = mod.request.bind(mod);
    mod.request = function guarded(options, ...rest) {
      if (!inCheck) {
        let target;
        if (typeof options === 'string') {
          target = options;
        } else if (options instanceof URL) {
          target = options.href;
        } else {
          const host = options.host || options.hostname || 'localhost';
          const port = options.port ? `:${options.port}` : '';
          target = `${proto}://${host}${port}${options.path || '/'}`;
        }
        check('http_request', (options && options.method) || 'GET', { url: target });
      }
      return originalRequest(options, ...rest);
    };
  }
}

try {
  protectModuleLoader();
  patchChildProcess();
  patchFs();
  patchHttp();
  const flusher = setInterval(flushAudit, FLUSH_INTERVAL_MS);
  if (flusher.unref) flusher.unref();
  process.on('exit', () => {
    try {
      flushAudit();
    } catch (_err) {
      /* best effort */
    }
  });
  debug('node hook installed');
} catch (err) {
  process.stderr.write(`sentinelgate: hook install failed: ${err}\n`);
}
"#;
