//! Dockerfile synthesis per framework class.
//!
//! The Dockerfile is generated from structured inputs (framework, node
//! version, output directory) rather than patched from user files. Three
//! shapes exist: a multi-stage standalone build for server-rendered
//! frameworks, a static build behind nginx for purely static frameworks,
//! and a generic node image otherwise.

use crate::store::Framework;

/// Name the generated Dockerfile is written under in the working directory.
pub const DOCKERFILE_NAME: &str = "Dockerfile.generated";

const DEFAULT_NODE_VERSION: &str = "20";

/// Deterministic image tag for a deployment.
pub fn image_tag(deployment_id: &str) -> String {
    format!("slipway/{}:latest", deployment_id)
}

/// Synthesize the Dockerfile for a deployment.
pub fn generate(framework: Framework, node_version: Option<&str>, output_dir: &str) -> String {
    let node = node_version.unwrap_or(DEFAULT_NODE_VERSION);
    match framework {
        Framework::Next => next_dockerfile(node),
        f if f.is_static() => static_dockerfile(node, output_dir),
        _ => node_dockerfile(node),
    }
}

fn next_dockerfile(node: &str) -> String {
    format!(
        r#"FROM node:{node}-alpine AS base

FROM base AS deps
RUN apk add --no-cache libc6-compat
WORKDIR /app
COPY package.json yarn.lock* package-lock.json* pnpm-lock.yaml* ./
RUN \
  if [ -f pnpm-lock.yaml ]; then corepack enable pnpm && pnpm install --frozen-lockfile; \
  elif [ -f yarn.lock ]; then yarn --frozen-lockfile; \
  elif [ -f package-lock.json ]; then npm ci; \
  else npm install; \
  fi

FROM base AS builder
WORKDIR /app
COPY --from=deps /app/node_modules ./node_modules
COPY . .
ENV NEXT_TELEMETRY_DISABLED=1
RUN npm run build

FROM base AS runner
WORKDIR /app
ENV NODE_ENV=production

RUN addgroup --system --gid 1001 nodejs
RUN adduser --system --uid 1001 nextjs

RUN mkdir -p ./public
COPY --from=builder /app/public ./public

COPY --from=builder --chown=nextjs:nodejs /app/.next/standalone ./
COPY --from=builder --chown=nextjs:nodejs /app/.next/static ./.next/static

USER nextjs

EXPOSE 3000
ENV PORT=3000
ENV HOSTNAME="0.0.0.0"

CMD ["node", "server.js"]
"#
    )
}

fn static_dockerfile(node: &str, output_dir: &str) -> String {
    format!(
        r#"FROM node:{node}-alpine AS builder

WORKDIR /app
COPY package.json yarn.lock* package-lock.json* pnpm-lock.yaml* ./
RUN \
  if [ -f pnpm-lock.yaml ]; then corepack enable pnpm && pnpm install --frozen-lockfile; \
  elif [ -f yarn.lock ]; then yarn --frozen-lockfile; \
  elif [ -f package-lock.json ]; then npm ci; \
  else npm install; \
  fi

COPY . .
RUN npm run build

FROM nginx:alpine
COPY --from=builder /app/{output_dir} /usr/share/nginx/html
EXPOSE 80
CMD ["nginx", "-g", "daemon off;"]
"#
    )
}

fn node_dockerfile(node: &str) -> String {
    format!(
        r#"FROM node:{node}-alpine

WORKDIR /app

COPY package*.json ./
RUN npm install --omit=dev

COPY . .

ENV NODE_ENV=production
EXPOSE 3000
ENV PORT=3000

CMD ["npm", "start"]
"#
    )
}
