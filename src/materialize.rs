//! Project materialization.
//!
//! Flattens a [`ProjectTree`] into the key→content map mounted into the
//! sandbox and unions it with the fixed build scaffold that makes a generated
//! front end runnable on its own.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::MaterializerConfig;
use crate::tree::{Node, ProjectTree};

/// Scaffold key of the package manifest.
pub const MANIFEST_KEY: &str = "package.json";
/// Scaffold key of the bundler config.
pub const BUNDLER_CONFIG_KEY: &str = "vite.config.js";
/// Scaffold key of the global stylesheet.
pub const STYLESHEET_KEY: &str = "src/index.css";
/// Scaffold key of the HTML shell.
pub const HTML_SHELL_KEY: &str = "index.html";
/// Scaffold key of the application bootstrap.
pub const APP_ENTRY_KEY: &str = "src/main.tsx";

/// Every scaffold key, in mount order.
pub const SCAFFOLD_KEYS: [&str; 5] = [
    MANIFEST_KEY,
    BUNDLER_CONFIG_KEY,
    STYLESHEET_KEY,
    HTML_SHELL_KEY,
    APP_ENTRY_KEY,
];

/// Port the dev server binds inside the sandbox.
pub const DEV_SERVER_PORT: u16 = 5173;

const MANIFEST: &str = r#"{
  "name": "web-project",
  "private": true,
  "type": "module",
  "scripts": {
    "dev": "vite --host"
  },
  "dependencies": {
    "react": "^18.2.0",
    "react-dom": "^18.2.0",
    "@types/react": "^18.2.0",
    "@types/react-dom": "^18.2.0",
    "tailwindcss": "^3.3.0",
    "postcss": "^8.4.31",
    "autoprefixer": "^10.4.16"
  },
  "devDependencies": {
    "@vitejs/plugin-react": "^4.0.0",
    "vite": "^4.3.9",
    "typescript": "^5.0.2"
  }
}
"#;

const BUNDLER_CONFIG: &str = r#"import { defineConfig } from 'vite';
import react from '@vitejs/plugin-react';
import tailwindcss from 'tailwindcss';
import autoprefixer from 'autoprefixer';

export default defineConfig({
  plugins: [react()],
  css: {
    postcss: {
      plugins: [
        tailwindcss({
          content: ['./index.html', './src/**/*.{js,ts,jsx,tsx}', './src_*.{js,ts,jsx,tsx}'],
          theme: { extend: {} },
          plugins: [],
        }),
        autoprefixer(),
      ],
    },
  },
  server: {
    host: true,
    port: 5173,
    strictPort: true,
    hmr: { clientPort: 443 },
  },
});
"#;

const STYLESHEET: &str = "@tailwind base;\n@tailwind components;\n@tailwind utilities;\n";

const HTML_SHELL: &str = r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="UTF-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1.0" />
    <title>Generated Website</title>
  </head>
  <body>
    <div id="root"></div>
    <script type="module" src="/src/main.tsx"></script>
  </body>
</html>
"#;

const APP_ENTRY: &str = r#"import React from 'react';
import ReactDOM from 'react-dom/client';
import './index.css';

function App() {
  return (
    <div className="min-h-screen bg-gray-100 py-12 px-4 sm:px-6 lg:px-8">
      <div className="max-w-7xl mx-auto">
        <h1 className="text-4xl font-bold text-gray-900">Welcome to your new website!</h1>
      </div>
    </div>
  );
}

ReactDOM.createRoot(document.getElementById('root')!).render(
  <React.StrictMode>
    <App />
  </React.StrictMode>
);
"#;

/// Flat key→content mapping handed to the sandbox mount call.
///
/// Keys iterate in sorted order so two materializations of the same tree
/// compare and mount identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct MaterializedFileSet {
    files: BTreeMap<String, String>,
}

impl MaterializedFileSet {
    /// Returns the content stored under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.files.get(key).map(String::as_str)
    }

    /// Returns true if `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.files.contains_key(key)
    }

    /// Iterates over `(key, content)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Iterates over keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns true if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Total content size in bytes.
    pub fn total_bytes(&self) -> usize {
        self.files.values().map(String::len).sum()
    }
}

/// Returns the scaffold entries synthesized for every run.
pub fn scaffold() -> [(&'static str, &'static str); 5] {
    [
        (MANIFEST_KEY, MANIFEST),
        (BUNDLER_CONFIG_KEY, BUNDLER_CONFIG),
        (STYLESHEET_KEY, STYLESHEET),
        (HTML_SHELL_KEY, HTML_SHELL),
        (APP_ENTRY_KEY, APP_ENTRY),
    ]
}

/// Converts project trees into mountable file sets.
#[derive(Debug, Clone, Default)]
pub struct Materializer {
    config: MaterializerConfig,
}

impl Materializer {
    /// Creates a materializer with the given filter configuration.
    pub fn new(config: MaterializerConfig) -> Self {
        Self { config }
    }

    /// Flattens `tree` and unions it with the scaffold.
    ///
    /// Scaffold entries overwrite any generated file that maps to the same key.
    pub fn materialize(&self, tree: &ProjectTree) -> MaterializedFileSet {
        let mut files = BTreeMap::new();
        for node in tree.nodes() {
            self.visit(node, &mut Vec::new(), &mut files);
        }

        let generated = files.len();
        for (key, content) in scaffold() {
            if files.insert(key.to_string(), content.to_string()).is_some() {
                tracing::debug!(key = %key, "scaffold entry replaced generated file");
            }
        }

        tracing::debug!(generated, total = files.len(), "materialized project tree");
        MaterializedFileSet { files }
    }

    fn visit<'a>(
        &self,
        node: &'a Node,
        ancestors: &mut Vec<&'a str>,
        out: &mut BTreeMap<String, String>,
    ) {
        if self.is_excluded(node.name()) {
            return;
        }

        match node {
            Node::Directory { name, children } => {
                ancestors.push(name);
                for child in children {
                    self.visit(child, ancestors, out);
                }
                ancestors.pop();
            }
            Node::File { name, content } => {
                if !self.has_allowed_extension(name) {
                    return;
                }
                let key = if self.config.root_config_files.iter().any(|c| c == name) {
                    name.clone()
                } else {
                    let mut flat = ancestors.join(self.config.delimiter.as_str());
                    if !flat.is_empty() {
                        flat.push_str(&self.config.delimiter);
                    }
                    flat.push_str(name);
                    format!("{}{}", self.config.namespace_prefix, flat)
                };
                out.insert(key, content.clone());
            }
        }
    }

    fn is_excluded(&self, segment: &str) -> bool {
        self.config
            .excluded_segments
            .iter()
            .any(|term| segment.contains(term.as_str()))
    }

    fn has_allowed_extension(&self, name: &str) -> bool {
        let ext = match name.rfind('.') {
            Some(idx) => &name[idx..],
            None => return false,
        };
        self.config.allowed_extensions.iter().any(|a| a == ext)
    }
}
